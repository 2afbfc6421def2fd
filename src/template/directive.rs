/// What a field's `value` asks for, parsed once from the raw string.
///
/// Anything that isn't exactly one of the recognised tokens is a [`Directive::Literal`], including
/// other `$` prefixed text, which is emitted verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Directive {
    Literal(String),
    /// `$NOW`, `$NOW+N`, `$NOW-N` with N in minutes
    Now { offset_minutes: i64 },
    /// `$TRV`, the timestamp of the current step of a time repeat
    RepeatTimestamp,
    /// `$INC0` to `$INC9`
    Increment { slot: usize },
    /// `$RND`
    Random,
    /// `$DAT`, optionally followed by digits which are ignored
    DataFile,
    /// `$B64`
    Base64File,
    /// `$STR1` to `$STR9`, 1 based store slot
    StoredRange { slot: usize },
    /// `$VARk`, 1 based argument position
    Argument { index: usize },
}

impl Directive {
    pub fn parse(raw: &str) -> Directive {
        Self::parse_token(raw).unwrap_or_else(|| Directive::Literal(raw.to_owned()))
    }

    fn parse_token(raw: &str) -> Option<Directive> {
        let token = raw.strip_prefix('$')?;

        if let Some(offset) = token.strip_prefix("NOW") {
            return parse_offset(offset).map(|offset_minutes| Directive::Now { offset_minutes });
        }
        if let Some(slot) = token.strip_prefix("INC") {
            return single_digit(slot, 0).map(|slot| Directive::Increment { slot });
        }
        if let Some(slot) = token.strip_prefix("STR") {
            return single_digit(slot, 1).map(|slot| Directive::StoredRange { slot });
        }
        if let Some(index) = token.strip_prefix("VAR") {
            return digits(index).map(|index| Directive::Argument { index });
        }
        if let Some(suffix) = token.strip_prefix("DAT") {
            return (suffix.is_empty() || digits(suffix).is_some()).then_some(Directive::DataFile);
        }

        match token {
            "TRV" => Some(Directive::RepeatTimestamp),
            "RND" => Some(Directive::Random),
            "B64" => Some(Directive::Base64File),
            _ => None,
        }
    }
}

fn parse_offset(offset: &str) -> Option<i64> {
    if offset.is_empty() {
        return Some(0);
    }
    let (sign, magnitude) = match offset.as_bytes()[0] {
        b'+' => (1, &offset[1..]),
        b'-' => (-1, &offset[1..]),
        _ => return None,
    };
    if magnitude.is_empty() || !magnitude.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // too large for an i64 is still an offset, expansion rejects it as out of range
    let magnitude = magnitude.parse::<i64>().unwrap_or(i64::MAX);
    Some(sign * magnitude)
}

fn single_digit(s: &str, lowest: usize) -> Option<usize> {
    match s.as_bytes() {
        [d @ b'0'..=b'9'] if (*d - b'0') as usize >= lowest => Some((*d - b'0') as usize),
        _ => None,
    }
}

fn digits(s: &str) -> Option<usize> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
