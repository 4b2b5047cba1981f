pub mod check_config;
pub mod keygen;
pub mod migrate;
