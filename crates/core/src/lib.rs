//! Shared data model for the Ed.Py compiler and token assembler
//!
//! Three things live here: the three-address IR (`program`), the diagnostic
//! sink and numbered message kinds (`diag`), and the fixed `Ed` device and
//! constant tables (`values`). Every pipeline stage depends on exactly this
//! crate, nothing more.

pub mod diag;
pub mod program;
pub mod values;

pub use diag::{DiagSink, Kind, Level, SinkKind};
pub use program::{Program, StageError};
