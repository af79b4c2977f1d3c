pub mod app;
pub mod nes;
