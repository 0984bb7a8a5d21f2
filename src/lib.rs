#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod code;
pub mod config;
pub mod entry;
pub mod heap;
pub mod hijack;
pub mod image;
pub mod patch;
pub mod patchset;
pub mod records;
pub mod timing;
pub mod verify;
