//! The stateless dispatcher, proxy layer and admin/telemetry JSON API that
//! sit on top of `qlb_core`'s registries and codec.

pub mod admin;
pub mod dispatcher;
pub mod proxy;
