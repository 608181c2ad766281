// Domain layer - Observations, control limits, charts, OEE and snapshots
pub mod chart;
pub mod errors;
pub mod limits;
pub mod observation;
pub mod oee;
pub mod snapshot;
