pub mod broker;
pub mod can;
pub mod runner;
