//! Domain types

pub mod command;
pub mod common;
pub mod finality;
pub mod operation;

pub use command::*;
pub use common::*;
pub use finality::*;
pub use operation::*;
