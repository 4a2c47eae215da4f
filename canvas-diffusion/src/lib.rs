//! Layout-conditioned diffusion rendering.
//!
//! An LLM writes a canvas (a set of rectangular regions, each with its own
//! description and color). This crate turns that canvas into cross-attention
//! conditioning, keeps exactly one stage's models resident on the accelerator
//! at a time, and runs a base denoising pass plus an optional highres pass.
//!
//! ```text
//! LLM response ──parse──▶ Canvas ──compile──▶ ConditioningBundle
//!                                                  │
//!        ensure_resident([unet]) ──▶ render ◀──────┘
//!        ensure_resident([vae])  ──▶ decode ──▶ [highres: resize, encode, render, decode]
//! ```
//!
//! The backbones are opaque: anything implementing
//! [`models::conditioning::TextEncoder`], [`models::render::NoisePredictor`]
//! and [`models::highres::LatentCodec`] can be driven. [`models::sdxl`]
//! provides implementations on top of `candle-transformers`.

pub mod config;
pub mod error;
pub mod models;

pub use error::{Error, Result};
