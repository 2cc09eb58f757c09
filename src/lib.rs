//! How well ICD-10 codelists cover the codes actually recorded in hospital and mortality data,
//! and how much prefix matching would change what they find.

pub mod catalog;
pub mod classify;
mod code;
pub mod codelist;
pub mod config;
pub mod consumers;
pub mod context;
pub mod coverage;
pub mod report;
pub mod scenario;
pub mod universe;
pub mod usage;
mod util;

pub use anyhow::{Context, Error};
use std::sync::Arc;

pub use crate::{
    code::{is_icd10_code, Icd10Code, MAX_CODE_LEN},
    config::Config,
    context::AnalysisContext,
    util::{header, row, ResultExt, Thousands},
};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
