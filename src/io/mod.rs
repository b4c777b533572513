// src/io/mod.rs
//
// Device-facing I/O. Only the serial link exists today.

pub mod serial;
