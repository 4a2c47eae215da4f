pub mod canvas;
pub mod chat;
pub mod conditioning;
pub mod highres;
pub mod lora;
pub mod pipeline;
pub mod render;
pub mod residency;
pub mod rng;
pub mod scheduler;
pub mod sdxl;
