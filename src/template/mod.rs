//! Template driven message generation.
//!
//! A template is a JSON document describing one or more messages segment by segment. Field values are
//! either literal text or a directive (`$NOW`, `$INC0`, `$RND`, `$VAR1`, ...) resolved while expanding.

pub mod buffer;
pub mod context;
pub mod directive;
pub mod engine;
pub mod loader;
pub mod model;

pub use context::GenerationContext;
pub use directive::Directive;
pub use engine::{expand, ExpandOptions, Expander, Expansion, FormHint, NoopObserver, RenderObserver};
pub use loader::{load_template, locate};
pub use model::{FieldDef, MessageDef, SegmentDef, Template};
