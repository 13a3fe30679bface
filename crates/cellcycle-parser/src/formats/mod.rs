mod arbin;
mod biologic;
mod common;
mod indigo;
mod maccor;
mod maccor_eis;
mod neware;
pub mod schema;

pub use arbin::ArbinParser;
pub use biologic::BiologicParser;
pub use common::{ParseOptions, RawColumns, SourceFile};
pub use indigo::IndigoParser;
pub use maccor::MaccorParser;
pub use neware::NewareParser;
