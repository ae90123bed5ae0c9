//! Backend implementations of the provider traits.

pub mod python;

pub use python::PythonBackend;
