//! Build-time configuration constants.
//!
//! Generated by `build.rs` from `rtcache.toml` (override the path with the
//! `RTCACHE_CONFIG` environment variable). See that file for the knobs and
//! their defaults.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));
