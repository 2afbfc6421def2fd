//! Expands a [`Template`] into wire format HL7 messages.

use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Duration, Local};
use log::{debug, trace};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::buffer::MessageBuffer;
use super::context::{GenerationContext, IncrementMode, SLOTS};
use super::directive::Directive;
use super::model::{FieldDef, SegmentDef, Template};
use crate::error::{DirectiveError, TemplateError};
use crate::locator::{COMPONENT_SEPARATOR, FIELD_SEPARATOR, HEADER_SEGMENT, SUBCOMPONENT_SEPARATOR};
use crate::HL7_TIMESTAMP;

/// Terminates every segment
pub const SEGMENT_TERMINATOR: u8 = b'\r';

/// Joins subfields, by nesting depth
const SUBFIELD_SEPARATORS: [u8; 2] = [COMPONENT_SEPARATOR, SUBCOMPONENT_SEPARATOR];

/// Upper bound on the messages one time repeat may produce
const MAX_REPEATS: usize = 100_000;

#[derive(Clone, Debug)]
pub struct ExpandOptions {
    /// Skip the argument count check and collect [`FormHint`]s for every `$VARk`
    pub interactive: bool,
    /// Where `$DAT` and `$B64` files are read from
    pub data_dir: PathBuf,
    /// Seed for `$RND` and random data file picks
    pub seed: Option<u64>,
    /// Pins "now" for `$NOW` and time repeats
    pub now: Option<DateTime<Local>>,
}

impl Default for ExpandOptions {
    fn default() -> Self {
        ExpandOptions {
            interactive: false,
            data_dir: PathBuf::from("data"),
            seed: None,
            now: None,
        }
    }
}

/// Describes one `$VARk` input, for a front end to build a form from
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FormHint {
    /// 1 based argument position
    pub index: usize,
    pub name: Option<String>,
    pub options: Vec<String>,
    pub default: Option<String>,
}

/// The result of a successful expansion
#[derive(Clone, Debug, Default)]
pub struct Expansion {
    /// One entry per generated message, each ending in a segment terminator
    pub messages: Vec<Bytes>,
    /// Only filled for interactive expansions
    pub form_hints: Vec<FormHint>,
}

impl Expansion {
    /// All messages back to back, ready to hand to [`crate::Client::send`]
    pub fn payload(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.messages.iter().map(Bytes::len).sum());
        for m in &self.messages {
            out.put_slice(m);
        }
        out.freeze()
    }
}

/// Notified as the wire form is produced, so a caller can build a parallel rendering
/// (a UI view, say) without re-parsing the output.
pub trait RenderObserver {
    fn segment_started(&mut self, _name: &str) {}
    fn field_resolved(&mut self, _segment: &str, _id: usize, _value: &str) {}
    fn message_finished(&mut self, _message: &[u8]) {}
}

/// Ignores everything
#[derive(Debug, Default)]
pub struct NoopObserver;

impl RenderObserver for NoopObserver {}

/// Expands `template` with default options.
pub fn expand(
    template: &Template,
    args: &[String],
    interactive: bool,
) -> Result<Expansion, TemplateError> {
    let options = ExpandOptions {
        interactive,
        ..ExpandOptions::default()
    };
    Expander::new(template, options).expand(args)
}

pub struct Expander<'t> {
    template: &'t Template,
    options: ExpandOptions,
}

impl<'t> Expander<'t> {
    pub fn new(template: &'t Template, options: ExpandOptions) -> Self {
        Expander { template, options }
    }

    pub fn expand(&self, args: &[String]) -> Result<Expansion, TemplateError> {
        self.expand_with(args, &mut NoopObserver)
    }

    /// Expands every message of the template. Any error aborts the whole expansion.
    pub fn expand_with(
        &self,
        args: &[String],
        observer: &mut dyn RenderObserver,
    ) -> Result<Expansion, TemplateError> {
        let expected = self.template.arg_count()?;
        if !self.options.interactive && args.len() != expected {
            return Err(TemplateError::ArgumentCount {
                expected,
                supplied: args.len(),
            });
        }

        let definitions = self.template.message_definitions()?;
        let now = self.options.now.unwrap_or_else(Local::now);
        let ctx = match self.options.seed {
            Some(seed) => GenerationContext::with_seed(seed),
            None => GenerationContext::new(),
        };

        let mut pass = Pass {
            options: &self.options,
            args,
            ctx,
            now,
            step: now,
            observer,
            data_files: HashMap::new(),
            form_hints: Vec::new(),
        };

        debug!("Expanding template with {} message definition(s)", definitions.len());
        let mut messages = Vec::new();
        for segments in definitions {
            for step in repeat_schedule(segments, now)? {
                pass.step = step;
                messages.push(pass.emit_message(segments)?);
            }
        }
        debug!("Expansion produced {} message(s)", messages.len());

        Ok(Expansion {
            messages,
            form_hints: pass.form_hints,
        })
    }
}

/// The instants to generate a message definition at: just `now`, `repeat` copies of `now`, or every
/// `inc` seconds across the MSH segment's `[start, end]` window.
fn repeat_schedule(
    segments: &[SegmentDef],
    now: DateTime<Local>,
) -> Result<Vec<DateTime<Local>>, TemplateError> {
    let header = match segments
        .iter()
        .find(|s| s.name.as_deref() == Some(HEADER_SEGMENT))
    {
        Some(header) => header,
        None => return Ok(vec![now]),
    };

    match &header.repeat {
        None | Some(Value::Null) => Ok(vec![now]),
        Some(Value::String(policy)) if policy.is_empty() || policy == "none" => Ok(vec![now]),
        Some(Value::String(policy)) if policy == "time" => time_window(header, now),
        Some(Value::String(count)) => match count.trim().parse::<usize>() {
            Ok(count) => repeat_count(count, now),
            Err(_) => Err(TemplateError::Repeat(format!("unknown policy '{}'", count))),
        },
        Some(Value::Number(count)) => match count.as_u64() {
            Some(count) => repeat_count(count as usize, now),
            None => Err(TemplateError::Repeat(format!("invalid count {}", count))),
        },
        Some(other) => Err(TemplateError::Repeat(format!("unsupported value {}", other))),
    }
}

fn repeat_count(count: usize, now: DateTime<Local>) -> Result<Vec<DateTime<Local>>, TemplateError> {
    if count == 0 || count > MAX_REPEATS {
        return Err(TemplateError::Repeat(format!(
            "count must be between 1 and {}, got {}",
            MAX_REPEATS, count
        )));
    }
    Ok(vec![now; count])
}

fn time_window(
    header: &SegmentDef,
    now: DateTime<Local>,
) -> Result<Vec<DateTime<Local>>, TemplateError> {
    let start = window_edge(now, header.start.as_ref(), "start")?;
    let end = window_edge(now, header.end.as_ref(), "end")?;
    let inc = header
        .inc
        .as_ref()
        .and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .filter(|inc| *inc > 0)
        .ok_or_else(|| TemplateError::Repeat("'inc' must be a positive number of seconds".into()))?;
    let inc = Duration::try_seconds(inc)
        .ok_or_else(|| TemplateError::Repeat(format!("'inc' of {} seconds is too large", inc)))?;

    if end < start {
        return Err(TemplateError::Repeat("'end' is before 'start'".into()));
    }

    let mut steps = Vec::new();
    let mut step = start;
    while step <= end {
        if steps.len() == MAX_REPEATS {
            return Err(TemplateError::Repeat(format!(
                "window produces more than {} messages",
                MAX_REPEATS
            )));
        }
        steps.push(step);
        step = match step.checked_add_signed(inc) {
            Some(next) => next,
            None => break,
        };
    }
    trace!("Time repeat: {} step(s) from {} to {}", steps.len(), start, end);
    Ok(steps)
}

fn window_edge(
    now: DateTime<Local>,
    value: Option<&Value>,
    key: &str,
) -> Result<DateTime<Local>, TemplateError> {
    shift_minutes(now, window_offset(value, key)?).ok_or_else(|| {
        TemplateError::Repeat(format!("'{}' is outside the representable time range", key))
    })
}

/// Minutes relative to now. Accepts a number, or a string such as `-0060`, `+15` or `$NOW-30`.
fn window_offset(value: Option<&Value>, key: &str) -> Result<i64, TemplateError> {
    let invalid = || TemplateError::Repeat(format!("'{}' is not a minute offset", key));
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n.as_i64().ok_or_else(invalid),
        Some(Value::String(s)) => {
            let s = s.trim();
            let s = s.strip_prefix('$').unwrap_or(s);
            let s = s.strip_prefix("NOW").unwrap_or(s);
            if s.is_empty() {
                return Ok(0);
            }
            let s = s.strip_prefix('+').unwrap_or(s);
            s.parse().map_err(|_| invalid())
        }
        Some(_) => Err(invalid()),
    }
}

/// State for one expansion pass
struct Pass<'a> {
    options: &'a ExpandOptions,
    args: &'a [String],
    ctx: GenerationContext,
    now: DateTime<Local>,
    /// Timestamp of the current repeat step
    step: DateTime<Local>,
    observer: &'a mut dyn RenderObserver,
    data_files: HashMap<PathBuf, Vec<String>>,
    form_hints: Vec<FormHint>,
}

impl<'a> Pass<'a> {
    fn emit_message(&mut self, segments: &[SegmentDef]) -> Result<Bytes, TemplateError> {
        self.ctx.begin_message();
        let mut buf = MessageBuffer::new();

        for (index, segment) in segments.iter().enumerate() {
            self.emit_segment(&mut buf, index, segment)?;
        }

        self.observer.message_finished(buf.as_slice());
        Ok(buf.freeze())
    }

    fn emit_segment(
        &mut self,
        buf: &mut MessageBuffer,
        index: usize,
        segment: &SegmentDef,
    ) -> Result<(), TemplateError> {
        let name = segment
            .name
            .as_deref()
            .ok_or(TemplateError::MissingSegmentName { index })?;
        let field_count = segment
            .field_count
            .ok_or_else(|| TemplateError::MissingFieldCount {
                segment: name.to_owned(),
            })?;

        let is_header = name == HEADER_SEGMENT;
        // MSH-1 is the separator written straight after the name, so MSH has one slot fewer
        let slots = if is_header {
            field_count.saturating_sub(1)
        } else {
            field_count
        };
        // ...but that separator is always written, whatever the declared count
        let padded = slots.max(usize::from(is_header));

        self.observer.segment_started(name);
        buf.push_str(name);

        let mut last = 0;
        for field in &segment.fields {
            let position = if is_header {
                match field.id {
                    0 => None,
                    1 => {
                        trace!("Skipping MSH-1, the field separator is implied");
                        continue;
                    }
                    id => Some(id - 1),
                }
            } else {
                Some(field.id).filter(|id| *id > 0)
            };

            let position = match position {
                Some(p) if p <= slots => p,
                _ => {
                    return Err(TemplateError::FieldOutOfRange {
                        segment: name.to_owned(),
                        field_count,
                        id: field.id,
                    })
                }
            };
            if position <= last {
                return Err(TemplateError::FieldOrder {
                    segment: name.to_owned(),
                    id: field.id,
                    previous: last + usize::from(is_header),
                });
            }

            // one separator per skipped field, plus this field's own
            buf.push_repeated(FIELD_SEPARATOR, position - last);
            self.emit_field(buf, name, field, 0)?;
            last = position;
        }

        buf.push_repeated(FIELD_SEPARATOR, padded - last);
        buf.push_byte(SEGMENT_TERMINATOR);
        Ok(())
    }

    fn emit_field(
        &mut self,
        buf: &mut MessageBuffer,
        segment: &str,
        field: &FieldDef,
        depth: usize,
    ) -> Result<(), TemplateError> {
        let value = self.resolve(field)?;
        self.observer.field_resolved(segment, field.id, &value);

        buf.push_str(&field.pre);
        buf.push_str(&value);
        buf.push_str(&field.post);

        if field.subfields.is_empty() {
            return Ok(());
        }

        let separator = *SUBFIELD_SEPARATORS
            .get(depth)
            .ok_or_else(|| TemplateError::SubfieldDepth {
                segment: segment.to_owned(),
                max_depth: SUBFIELD_SEPARATORS.len(),
            })?;

        // subfield ids are their own numbering scope, the parent's `last` is untouched
        let mut last = 0;
        for sub in &field.subfields {
            if sub.id <= last {
                return Err(TemplateError::FieldOrder {
                    segment: segment.to_owned(),
                    id: sub.id,
                    previous: last,
                });
            }
            let gap = if last == 0 { sub.id - 1 } else { sub.id - last };
            buf.push_repeated(separator, gap);
            self.emit_field(buf, segment, sub, depth + 1)?;
            last = sub.id;
        }
        Ok(())
    }

    fn resolve(&mut self, field: &FieldDef) -> Result<String, TemplateError> {
        let value = match Directive::parse(&field.value) {
            Directive::Literal(text) => text,
            Directive::Now { offset_minutes } => match shift_minutes(self.now, offset_minutes) {
                Some(at) => timestamp(at),
                None => {
                    return Err(DirectiveError::InvalidParameter {
                        directive: "$NOW",
                        parameter: "offset",
                        reason: format!("{} minutes is outside the representable time range", offset_minutes),
                    }
                    .into())
                }
            },
            Directive::RepeatTimestamp => timestamp(self.step),
            Directive::Increment { slot } => self.increment(slot, field)?.to_string(),
            Directive::Random => self.random(field)?,
            Directive::DataFile => self.data_file_line(field)?,
            Directive::Base64File => self.base64_file(field)?,
            Directive::StoredRange { slot } => self.stored_range(slot, field)?,
            Directive::Argument { index } => self.argument(index, field)?,
        };
        Ok(value)
    }

    fn increment(&mut self, slot: usize, field: &FieldDef) -> Result<i64, DirectiveError> {
        let mode = match field.kind.as_deref() {
            None | Some("use") => IncrementMode::PerUse,
            Some("msg") => IncrementMode::PerMessage,
            Some(other) => {
                return Err(DirectiveError::InvalidParameter {
                    directive: "$INC",
                    parameter: "type",
                    reason: format!("expected 'use' or 'msg', got '{}'", other),
                })
            }
        };
        let start = field.start.unwrap_or(0);
        let max = field.max.map(|m| m as i64);

        Ok(self.ctx.next_increment(slot, start, max, mode))
    }

    fn random(&mut self, field: &FieldDef) -> Result<String, DirectiveError> {
        let missing = |parameter| DirectiveError::MissingParameter {
            directive: "$RND",
            parameter,
        };
        let min = field.min.ok_or_else(|| missing("min"))?;
        let max = field.max.ok_or_else(|| missing("max"))?;
        let dp = field.dp.ok_or_else(|| missing("dp"))?;

        if !(min <= max) {
            return Err(DirectiveError::InvalidParameter {
                directive: "$RND",
                parameter: "min",
                reason: format!("{} is greater than max {}", min, max),
            });
        }

        let (value, text) = if dp == 0 {
            let (low, high) = (min.ceil() as i64, max.floor() as i64);
            if low > high {
                return Err(DirectiveError::InvalidParameter {
                    directive: "$RND",
                    parameter: "max",
                    reason: format!("no integer lies in [{}, {}]", min, max),
                });
            }
            let n = self.ctx.rng().gen_range(low..=high);
            (n as f64, n.to_string())
        } else {
            let raw = self.ctx.rng().gen_range(min..=max);
            let text = format!("{:.*}", dp as usize, raw);
            (text.parse().unwrap_or(raw), text)
        };

        if let Some(store) = field.store {
            let slot = store
                .checked_sub(1)
                .filter(|slot| *slot < SLOTS)
                .ok_or_else(|| DirectiveError::InvalidParameter {
                    directive: "$RND",
                    parameter: "store",
                    reason: format!("must be between 1 and {}, got {}", SLOTS, store),
                })?;
            self.ctx.store(slot, value);
        }

        if field.hidden {
            Ok(String::new())
        } else {
            Ok(text)
        }
    }

    fn data_file_line(&mut self, field: &FieldDef) -> Result<String, DirectiveError> {
        let name = data_file_name(field, "$DAT")?;
        let path = self.options.data_dir.join(name);
        let message_count = self.ctx.message_count();
        let message_rand = self.ctx.message_rand() as usize;

        if !self.data_files.contains_key(&path) {
            let lines = read_lines(&path)?;
            self.data_files.insert(path.clone(), lines);
        }
        let total = self.data_files[&path].len();

        let index = match field.kind.as_deref() {
            None | Some("random") | Some("rand") => self.ctx.rng().gen_range(0..total),
            Some("msgRand") => (message_rand * total / 100).min(total - 1),
            Some("seq") | Some("msg") => (message_count - 1) % total,
            Some(other) => {
                return Err(DirectiveError::InvalidParameter {
                    directive: "$DAT",
                    parameter: "type",
                    reason: format!("expected 'random', 'msgRand' or 'seq', got '{}'", other),
                })
            }
        };
        trace!("$DAT {}: line {} of {}", path.display(), index + 1, total);

        Ok(self.data_files[&path][index].clone())
    }

    fn base64_file(&mut self, field: &FieldDef) -> Result<String, DirectiveError> {
        let path = self.options.data_dir.join(data_file_name(field, "$B64")?);
        let contents = fs::read(&path).map_err(|source| DirectiveError::DataFile {
            path: path.display().to_string(),
            source,
        })?;
        Ok(base64::engine::general_purpose::STANDARD.encode(contents))
    }

    fn stored_range(&mut self, slot: usize, field: &FieldDef) -> Result<String, DirectiveError> {
        if field.ranges.is_empty() {
            return Err(DirectiveError::MissingParameter {
                directive: "$STR",
                parameter: "ranges",
            });
        }
        let stored = self.ctx.stored(slot - 1);

        for (label, threshold) in &field.ranges {
            let threshold = match threshold {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }
            .ok_or_else(|| DirectiveError::InvalidParameter {
                directive: "$STR",
                parameter: "ranges",
                reason: format!("threshold for '{}' is not a number", label),
            })?;

            if threshold >= stored {
                return Ok(label.clone());
            }
        }

        trace!("$STR{}: {} is above every range", slot, stored);
        Ok(String::new())
    }

    fn argument(&mut self, index: usize, field: &FieldDef) -> Result<String, TemplateError> {
        if self.options.interactive {
            if index == 0 {
                return Err(TemplateError::ArgumentIndex {
                    index,
                    supplied: self.args.len(),
                });
            }
            if !self.form_hints.iter().any(|h| h.index == index) {
                self.form_hints.push(FormHint {
                    index,
                    name: field.name.clone(),
                    options: field.options.clone(),
                    default: field.default.clone(),
                });
            }
            let value = self
                .args
                .get(index - 1)
                .or(field.default.as_ref())
                .cloned()
                .unwrap_or_default();
            return Ok(value);
        }

        index
            .checked_sub(1)
            .and_then(|i| self.args.get(i))
            .cloned()
            .ok_or(TemplateError::ArgumentIndex {
                index,
                supplied: self.args.len(),
            })
    }
}

/// `None` when the shifted instant can't be represented
fn shift_minutes(at: DateTime<Local>, minutes: i64) -> Option<DateTime<Local>> {
    Duration::try_minutes(minutes).and_then(|delta| at.checked_add_signed(delta))
}

fn timestamp(at: DateTime<Local>) -> String {
    at.format(HL7_TIMESTAMP).to_string()
}

fn data_file_name<'f>(field: &'f FieldDef, directive: &'static str) -> Result<&'f str, DirectiveError> {
    field
        .datafile
        .as_deref()
        .ok_or(DirectiveError::MissingParameter {
            directive,
            parameter: "datafile",
        })
}

fn read_lines(path: &Path) -> Result<Vec<String>, DirectiveError> {
    let contents = fs::read_to_string(path).map_err(|source| DirectiveError::DataFile {
        path: path.display().to_string(),
        source,
    })?;
    let lines: Vec<String> = contents.lines().map(str::to_owned).collect();
    if lines.is_empty() {
        return Err(DirectiveError::EmptyDataFile {
            path: path.display().to_string(),
        });
    }
    Ok(lines)
}
