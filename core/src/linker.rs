//! CRO/CRS dynamic relocatable-object linker.

pub mod format;
pub mod module;
pub mod ops;
