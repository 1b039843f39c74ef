//! Side-effecting collaborators: devices, capture, recognition, run outputs.

pub mod actuator;
pub mod anchor;
pub mod config;
pub mod documents;
pub mod evidence;
pub mod frames;
pub mod ocr;
pub mod process;
pub mod protocol;
pub mod receipt;
pub mod reliable;
pub mod serial;
pub mod synthetic;
pub mod trace;
