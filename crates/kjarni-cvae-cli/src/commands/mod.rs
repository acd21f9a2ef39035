pub mod config;
pub mod infer;
pub mod train_forward;

mod util;
