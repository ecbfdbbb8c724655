//! The built-in node set.

pub mod converters;
pub mod data_provider;
pub mod instance_converter;
pub mod instance_provider;
pub mod metadata_filter;
pub mod scene_sink;
pub mod streamer;
