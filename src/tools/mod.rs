//! Sample custom tool implementations.
//!
//! The Custom Tool Registry (`crate::custom_tools`) is the mechanism an embedder registers tools
//! through; this module supplies one worked example registered by
//! [`CustomToolRegistry::register_calculator`](crate::custom_tools::CustomToolRegistry::register_calculator).
//!
//! - **Calculator**: scientific calculator evaluating a single expression string
//!   - Arithmetic, trigonometric, and logarithmic functions via `evalexpr`
//!   - Stateless and thread-safe

pub mod calculator;

pub use calculator::{Calculator, CalculatorError, CalculatorResult};
