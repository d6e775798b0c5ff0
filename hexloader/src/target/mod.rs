//! Target chip abstraction and programmers.

pub mod avr;
pub mod chip;

pub use avr::Stk500Programmer;
pub use chip::{ChipConfig, ChipFamily, Programmer};
