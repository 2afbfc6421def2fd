//! Positional lookup of fields inside a pipe/hat delimited HL7 message.
//!
//! Fields are numbered the way HL7 numbers them. For `MSH` that means field 1 *is* the field
//! separator, so `MSH-N` sits after N-1 separators while every other segment's field N sits after N.

/// Separates fields within a segment
pub const FIELD_SEPARATOR: u8 = b'|';
/// Separates components within a field
pub const COMPONENT_SEPARATOR: u8 = b'^';
/// Separates sub-components within a component
pub const SUBCOMPONENT_SEPARATOR: u8 = b'&';
/// A delimiter directly preceded by this is data, not structure
pub const ESCAPE: u8 = b'\\';

/// The header segment, whose field numbering is shifted by one.
pub const HEADER_SEGMENT: &str = "MSH";

/// Iterates the non-empty segments of a message, split on CR or LF not preceded by an escape.
pub fn segments(message: &[u8]) -> Segments<'_> {
    Segments {
        remaining: message,
    }
}

#[derive(Debug, Clone)]
pub struct Segments<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        while !self.remaining.is_empty() {
            let end = unescaped_position(self.remaining, |b| b == b'\r' || b == b'\n')
                .unwrap_or(self.remaining.len());
            let segment = &self.remaining[..end];
            self.remaining = &self.remaining[(end + 1).min(self.remaining.len())..];

            if !segment.is_empty() {
                return Some(segment);
            }
        }
        None
    }
}

/// The segment identifier, ie everything before the first field separator.
pub fn segment_name(segment: &[u8]) -> &[u8] {
    let end = unescaped_position(segment, |b| b == FIELD_SEPARATOR).unwrap_or(segment.len());
    &segment[..end]
}

/// Finds `field` of the first `segment_name` segment in `message`.
///
/// Returns `None` when there's no such segment, or it has fewer fields than asked for.
/// ```
/// use hl7_mllp_sim::locator::find_field;
/// let msg = b"MSH|^~\\&|APP|FAC|||20240101||ADT^A01|CTRL1|P|2.5\rPID|1||12345";
/// assert_eq!(find_field(msg, "MSH", 10), Some(&b"CTRL1"[..]));
/// assert_eq!(find_field(msg, "PID", 3), Some(&b"12345"[..]));
/// assert_eq!(find_field(msg, "PID", 9), None);
/// ```
pub fn find_field<'a>(message: &'a [u8], segment_name: &str, field: usize) -> Option<&'a [u8]> {
    find_field_nth(message, segment_name, 1, field)
}

/// Finds `field` of the `occurrence`th (1 based) `segment_name` segment in `message`.
pub fn find_field_nth<'a>(
    message: &'a [u8],
    segment_name: &str,
    occurrence: usize,
    field: usize,
) -> Option<&'a [u8]> {
    if occurrence == 0 || field == 0 {
        return None;
    }

    let segment = segments(message)
        .filter(|s| self::segment_name(s) == segment_name.as_bytes())
        .nth(occurrence - 1)?;

    let separators_to_skip = if segment_name == HEADER_SEGMENT {
        if field == 1 {
            // MSH-1 is the separator character itself
            return segment.get(HEADER_SEGMENT.len()..HEADER_SEGMENT.len() + 1);
        }
        field - 1
    } else {
        field
    };

    field_after_separators(segment, separators_to_skip)
}

fn field_after_separators(segment: &[u8], count: usize) -> Option<&[u8]> {
    let mut seen = 0;
    let mut escaped = false;

    for (i, &b) in segment.iter().enumerate() {
        if b == FIELD_SEPARATOR && !escaped {
            seen += 1;
            if seen == count {
                let rest = &segment[i + 1..];
                let end = unescaped_position(rest, |b| b == FIELD_SEPARATOR).unwrap_or(rest.len());
                return Some(&rest[..end]);
            }
        }
        escaped = b == ESCAPE && !escaped;
    }

    None
}

fn unescaped_position(haystack: &[u8], is_delimiter: impl Fn(u8) -> bool) -> Option<usize> {
    let mut escaped = false;
    for (i, &b) in haystack.iter().enumerate() {
        if is_delimiter(b) && !escaped {
            return Some(i);
        }
        escaped = b == ESCAPE && !escaped;
    }
    None
}
