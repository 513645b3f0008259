pub mod analysis;
pub mod autograd;
pub mod config;
pub mod device;
pub mod error;
pub mod instrument;
pub mod models;
pub mod nn;
pub mod optim;
pub mod postprocess;
pub mod recorder;
pub mod sharding;
pub mod trace;
pub mod trainer;
