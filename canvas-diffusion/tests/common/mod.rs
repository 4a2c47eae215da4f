//! Small deterministic backends built from tensor ops, standing in for SDXL.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use candle::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};
use canvas_diffusion::models::conditioning::{TextEncoder, Tokenize};
use canvas_diffusion::models::highres::LatentCodec;
use canvas_diffusion::models::pipeline::{LATENT_CHANNELS, REGIONAL_PIPELINE};
use canvas_diffusion::models::render::{Conditioning, NoisePredictor};
use canvas_diffusion::models::residency::{
    CheckpointId, Component, ComponentKind, HostWeights, LoadedPipeline, PipelineLoader,
};
use canvas_diffusion::models::sdxl::SdxlVae;
use canvas_diffusion::{Error, Result};

pub const HIDDEN: usize = 8;

pub const RESPONSE: &str = r#"Here is the layout.

```python
canvas = Canvas()
canvas.set_global_description(
    description='A red barn in a green field.',
    detailed_descriptions=['Late afternoon light.', 'Rolling hills.'],
    tags='barn, field, farm',
    HTML_web_color_name='skyblue',
)
canvas.add_local_description(
    location='on the left',
    offset='no offset',
    area='a medium-sized vertical area',
    distance_to_viewer=5.0,
    description='A red barn.',
    detailed_descriptions=['Weathered planks.'],
    tags='barn',
    atmosphere='Calm.',
    style='Photograph.',
    quality_meta='High quality.',
    HTML_web_color_name='darkred',
)
```"#;

/// One id per byte.
pub struct ByteTokenizer;

impl Tokenize for ByteTokenizer {
    fn ids(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(|b| b as u32 + 3).collect())
    }
    fn bos(&self) -> u32 {
        1
    }
    fn eos(&self) -> u32 {
        2
    }
    fn pad(&self) -> u32 {
        0
    }
}

/// Embeds id `t` as `t / 300` on every hidden unit; pooled is the mean.
pub struct ToyEncoder;

impl TextEncoder for ToyEncoder {
    fn encode(&self, ids: &Tensor, lora_scale: f64) -> Result<(Tensor, Tensor)> {
        let seq = ((ids.to_dtype(DType::F32)? / 300.0)? * (1.0 + lora_scale))?
            .unsqueeze(2)?
            .repeat((1, 1, HIDDEN))?;
        let pooled = seq.mean(1)?;
        Ok((seq, pooled))
    }
}

/// `eps = 0.9 · x + 0.05 · mean(embeds)`, per sample.
pub struct ToyUnet;

impl NoisePredictor for ToyUnet {
    fn predict(&self, x: &Tensor, _timestep: f64, cond: &Conditioning<'_>) -> Result<Tensor> {
        let batch = x.dims4()?.0;
        let bias = cond.embeds.flatten_from(1)?.mean(D::Minus1)?.reshape((batch, 1, 1, 1))?;
        Ok(((x * 0.9)?.broadcast_add(&(bias * 0.05)?))?)
    }
}

/// Average-pools pixels by 8 into 4 channels and upsamples them back.
pub struct ToyVae {
    fail_encode: bool,
}

impl LatentCodec for ToyVae {
    fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
        if self.fail_encode {
            return Err(Error::Candle(candle::Error::Msg("out of memory".to_string())));
        }
        let pooled = pixels.avg_pool2d(8)?;
        let luma = pooled.mean_keepdim(1)?;
        Ok(Tensor::cat(&[&pooled, &luma], 1)?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = latents.dims4()?;
        Ok(latents.narrow(1, 0, 3)?.upsample_nearest2d(h * 8, w * 8)?.tanh()?)
    }
}

/// An SDXL-shaped VAE small enough for CPU tests: three downsamplings, so
/// latents are an eighth of the image size.
pub fn small_vae_config() -> AutoEncoderKLConfig {
    AutoEncoderKLConfig {
        block_out_channels: vec![32, 32, 32, 32],
        layers_per_block: 1,
        latent_channels: LATENT_CHANNELS,
        norm_num_groups: 32,
        use_quant_conv: true,
        use_post_quant_conv: true,
    }
}

/// Randomly initialized weights for [`small_vae_config`].
pub fn small_vae_weights() -> Result<HashMap<String, Tensor>> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    AutoEncoderKL::new(vb, 3, 3, small_vae_config())?;
    let data = varmap.data().lock().unwrap();
    Ok(data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect())
}

/// Shared log of loader activity.
pub type Events = Rc<RefCell<Vec<String>>>;

/// Components placed on the accelerator, in order.
pub fn placements(events: &Events) -> Vec<String> {
    events
        .borrow()
        .iter()
        .filter_map(|e| e.strip_prefix("place ").map(str::to_string))
        .collect()
}

pub struct ToyLoader {
    pub kind: &'static str,
    pub fail_highres_encode: bool,
    /// When set, the VAE is the real SDXL autoencoder built from these weights.
    pub vae_weights: Option<HashMap<String, Tensor>>,
    pub events: Events,
}

impl ToyLoader {
    pub fn new() -> Self {
        Self {
            kind: REGIONAL_PIPELINE,
            fail_highres_encode: false,
            vae_weights: None,
            events: Events::default(),
        }
    }

    pub fn with_small_vae() -> Result<Self> {
        let mut loader = Self::new();
        loader.vae_weights = Some(small_vae_weights()?);
        Ok(loader)
    }

    fn component<T: 'static>(
        &self,
        kind: ComponentKind,
        staged: HashMap<String, Tensor>,
        build: impl Fn(&HostWeights, &Device) -> Result<T> + 'static,
    ) -> Component<T> {
        let (reads, places) = (self.events.clone(), self.events.clone());
        Component::new(
            kind,
            DType::F32,
            1 << 20,
            Box::new(move || {
                reads.borrow_mut().push(format!("read {kind}"));
                Ok(HostWeights::Tensors(staged.clone()))
            }),
            Box::new(move |staged: &HostWeights, device: &Device| -> Result<T> {
                places.borrow_mut().push(format!("place {kind}"));
                build(staged, device)
            }),
        )
    }
}

impl PipelineLoader for ToyLoader {
    fn load(&self, id: &CheckpointId) -> Result<LoadedPipeline> {
        self.events.borrow_mut().push(format!("load {}", id.name));
        let fail_encode = self.fail_highres_encode;
        let vae = match &self.vae_weights {
            Some(weights) => self.component(ComponentKind::Vae, weights.clone(), |staged, device| {
                let vae = SdxlVae::from_tensors(staged.tensors()?, small_vae_config(), device)?;
                Ok(Box::new(vae) as Box<dyn LatentCodec>)
            }),
            None => self.component(ComponentKind::Vae, HashMap::new(), move |_, _| {
                Ok(Box::new(ToyVae { fail_encode }) as Box<dyn LatentCodec>)
            }),
        };
        Ok(LoadedPipeline {
            id: id.clone(),
            kind: self.kind,
            tokenizer: Box::new(ByteTokenizer),
            tokenizer_2: Box::new(ByteTokenizer),
            text_encoder: self.component(ComponentKind::TextEncoder, HashMap::new(), |_, _| {
                Ok(Box::new(ToyEncoder) as Box<dyn TextEncoder>)
            }),
            text_encoder_2: self.component(ComponentKind::TextEncoder2, HashMap::new(), |_, _| {
                Ok(Box::new(ToyEncoder) as Box<dyn TextEncoder>)
            }),
            unet: self.component(ComponentKind::Unet, HashMap::new(), |_, _| {
                Ok(Box::new(ToyUnet) as Box<dyn NoisePredictor>)
            }),
            vae,
            lora: None,
        })
    }
}
