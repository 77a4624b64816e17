pub mod aggregate;
pub mod blast;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod governor;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod protparam;
pub mod rcsb;
pub mod record;
pub mod retry;
pub mod source;
pub mod uniprot;
