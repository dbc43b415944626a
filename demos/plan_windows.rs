//! Example: inspect and run a chain of context schemes
//!
//! Prints the windows every step would use, then runs a toy model that
//! averages each window through the windowed driver.
//!
//! # Usage
//!
//! ```bash
//! # CPU backend
//! RUST_LOG=debug cargo run --example plan_windows --features cpu
//!
//! # Metal backend (macOS)
//! cargo run --example plan_windows --features metal --release
//! ```

use burn::prelude::*;
use burn::tensor::{Distribution, ElementConversion};
use sliding_context_burn::{
    ContextError, ContextExtrasGroup, ContextOptions, ContextOptionsGroup, ContextRef, ContextRun, NaiveReuse,
    StepProgress,
};
use tracing_subscriber::EnvFilter;

// Backend and device type selection based on features
#[cfg(feature = "metal")]
mod backend {
    pub type Backend = burn::backend::candle::Candle;
    pub type Device = burn::backend::candle::CandleDevice;

    pub fn get_device() -> Device {
        Device::metal(0)
    }
}

#[cfg(all(feature = "cuda", not(feature = "metal")))]
mod backend {
    pub type Backend = burn::backend::candle::Candle;
    pub type Device = burn::backend::candle::CandleDevice;

    pub fn get_device() -> Device {
        Device::cuda(0)
    }
}

#[cfg(not(any(feature = "metal", feature = "cuda")))]
mod backend {
    pub type Backend = burn::backend::ndarray::NdArray<f32>;
    pub type Device = burn::backend::ndarray::NdArrayDevice;

    pub fn get_device() -> Device {
        Device::Cpu
    }
}

use backend::{get_device, Backend};

const FRAMES: usize = 48;
const STEPS: usize = 8;

fn main() -> Result<(), ContextError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let extras = ContextExtrasGroup::new()
        .add(NaiveReuse::default().into())
        .add(ContextRef::default().into());
    let group = ContextOptionsGroup::new()
        .add(ContextOptions::looped_uniform(16, 4, 4, true))?
        .add(ContextOptions::standard_static(16, 4).with_start_percent(0.5).with_guarantee_steps(2))?
        .add(ContextOptions::batched(16).with_start_percent(0.75))?
        .with_extras(extras);

    println!("Windows over {} frames, {} steps:", FRAMES, STEPS);
    for plan in group.plan(FRAMES, STEPS)? {
        let starts: Vec<usize> = plan.windows.iter().filter_map(|w| w.first()).collect();
        println!(
            "  step {:>2} ({:.2}): options #{} -> {} windows starting at {:?}",
            plan.progress.step,
            plan.progress.percent(),
            plan.context_index,
            plan.windows.len(),
            starts
        );
    }

    // [batch, channels, frames, height, width]
    let device = get_device();
    let mut latent = Tensor::<Backend, 5>::random(
        [1, 4, FRAMES, 8, 8],
        Distribution::Normal(0.0, 1.0),
        &device,
    );

    let mut run = ContextRun::<Backend, 5>::new(&group, FRAMES, 2)?;
    for step in 0..STEPS {
        let progress = StepProgress::new(step, STEPS);
        let denoised = run.forward(latent.clone(), progress, |x, _call| {
            // Toy model: pull every window towards its temporal mean
            let mean = x.clone().mean_dim(2);
            Ok(x * 0.5 + mean * 0.5)
        })?;
        latent = denoised;
        println!("  step {:>2}: latent mean {:.4}", step, latent.clone().mean().into_scalar().elem::<f32>());
    }

    Ok(())
}
