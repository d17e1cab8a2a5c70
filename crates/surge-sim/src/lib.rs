//! # surge-sim - control surface for the surge engine
//!
//! The `surge` binary (run / profiles / serve) and the HTTP control API it
//! serves. All traffic generation and telemetry lives in `surge-core`; this
//! crate only translates commands into engine calls.

// HTTP Control API
pub mod api;

pub mod duration;

pub use api::{
    ApiConfig, ApiResponse, ProfilesResponse, RejectedProfile, SharedState, StartResponse,
    handle_get_status, handle_list_campaigns, handle_list_profiles, handle_metrics,
    handle_monitor_status, handle_start, handle_start_monitor, handle_stop, handle_stop_monitor,
    print_api_docs, router,
};
pub use duration::parse_duration;
