//! Accelerator memory residency.
//!
//! Every model the studio uses is wrapped in a [`Component`]. The components
//! never move themselves: [`ModelRegistry::ensure_resident`] is the only place
//! placements change. It is called at stage boundaries with the set of
//! components the next stage needs, evicts everything else first, then loads
//! the requested set, so peak accelerator memory is the footprint of the
//! largest single stage rather than the sum of all models.
//!
//! candle modules cannot be moved between devices after construction, so a
//! component is placed by building it on the target device from weights
//! staged in host memory.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use candle::{DType, Device, Tensor};
use serde::Deserialize;

use crate::models::chat::CausalLm;
use crate::models::conditioning::{TextEncoder, Tokenize};
use crate::models::highres::LatentCodec;
use crate::models::lora::LoraSelection;
use crate::models::render::NoisePredictor;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    TextEncoder,
    TextEncoder2,
    Vae,
    Unet,
    Llm,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 5] = [
        Self::TextEncoder,
        Self::TextEncoder2,
        Self::Vae,
        Self::Unet,
        Self::Llm,
    ];
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TextEncoder => "text_encoder",
            Self::TextEncoder2 => "text_encoder_2",
            Self::Vae => "vae",
            Self::Unet => "unet",
            Self::Llm => "llm",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Accelerator,
    Host,
    Unloaded,
}

impl fmt::Display for Residency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Accelerator => "on the accelerator",
            Self::Host => "in host memory",
            Self::Unloaded => "unloaded",
        };
        f.write_str(name)
    }
}

/// Where evicted components go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Drop the weights entirely; the next placement reloads them.
    #[default]
    Unload,
    /// Keep the weights in host memory; the next placement skips the disk.
    Host,
}

/// Weights of one component staged in host memory.
pub enum HostWeights {
    /// Named CPU tensors, as read from safetensors files.
    Tensors(HashMap<String, Tensor>),
    /// A serialized model file kept in memory, e.g. GGUF.
    Bytes(Vec<u8>),
}

impl HostWeights {
    pub fn tensors(&self) -> Result<&HashMap<String, Tensor>> {
        match self {
            Self::Tensors(tensors) => Ok(tensors),
            Self::Bytes(_) => Err(Error::invalid("weights", "expected named tensors, found a serialized file")),
        }
    }

    pub fn bytes(&self) -> Result<&[u8]> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Tensors(_) => Err(Error::invalid("weights", "expected a serialized file, found named tensors")),
        }
    }
}

/// Reads a component's weights into host memory.
pub type Stager = Box<dyn Fn() -> Result<HostWeights>>;

/// Builds a component on a device from its staged weights.
pub type Builder<T> = Box<dyn Fn(&HostWeights, &Device) -> Result<T>>;

enum Slot<T> {
    Unloaded,
    Host(HostWeights),
    Accelerator { model: T, staged: Option<HostWeights> },
}

/// A model whose device placement is owned by the registry.
///
/// Placing reads the weights into host memory once and builds the model on
/// the accelerator from them. Under [`EvictionPolicy::Host`] the staged
/// weights outlive the accelerator copy, so later placements skip the disk.
pub struct Component<T> {
    kind: ComponentKind,
    dtype: DType,
    footprint: u64,
    stage: Stager,
    build: Builder<T>,
    slot: Slot<T>,
}

impl<T> Component<T> {
    /// Creates an unloaded component. Nothing is read until it is placed.
    pub fn new(kind: ComponentKind, dtype: DType, footprint: u64, stage: Stager, build: Builder<T>) -> Self {
        Self {
            kind,
            dtype,
            footprint,
            stage,
            build,
            slot: Slot::Unloaded,
        }
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Approximate size of the weights in bytes.
    pub fn footprint(&self) -> u64 {
        self.footprint
    }

    pub fn residency(&self) -> Residency {
        match self.slot {
            Slot::Unloaded => Residency::Unloaded,
            Slot::Host(_) => Residency::Host,
            Slot::Accelerator { .. } => Residency::Accelerator,
        }
    }

    /// Borrows the model. Fails unless it currently sits on the accelerator.
    pub fn get(&self) -> Result<&T> {
        match &self.slot {
            Slot::Accelerator { model, .. } => Ok(model),
            _ => Err(self.violation()),
        }
    }

    pub fn get_mut(&mut self) -> Result<&mut T> {
        let found = self.residency();
        match &mut self.slot {
            Slot::Accelerator { model, .. } => Ok(model),
            _ => Err(Error::ResidencyViolation {
                component: self.kind,
                found,
            }),
        }
    }

    fn violation(&self) -> Error {
        Error::ResidencyViolation {
            component: self.kind,
            found: self.residency(),
        }
    }
}

/// Type-erased view the registry uses to move heterogeneous components.
pub trait Movable {
    fn kind(&self) -> ComponentKind;
    fn residency(&self) -> Residency;
    fn footprint(&self) -> u64;
    fn place(&mut self, accelerator: &Device, policy: EvictionPolicy) -> Result<()>;
    fn evict(&mut self, policy: EvictionPolicy) -> Result<()>;
}

impl<T> Movable for Component<T> {
    fn kind(&self) -> ComponentKind {
        self.kind
    }

    fn residency(&self) -> Residency {
        Component::residency(self)
    }

    fn footprint(&self) -> u64 {
        self.footprint
    }

    fn place(&mut self, accelerator: &Device, policy: EvictionPolicy) -> Result<()> {
        let staged = match std::mem::replace(&mut self.slot, Slot::Unloaded) {
            placed @ Slot::Accelerator { .. } => {
                self.slot = placed;
                return Ok(());
            }
            Slot::Host(staged) => {
                tracing::debug!(component = %self.kind, "moving from host");
                staged
            }
            Slot::Unloaded => {
                tracing::debug!(component = %self.kind, "reading weights");
                (self.stage)()?
            }
        };
        tracing::debug!(component = %self.kind, bytes = self.footprint, "placing on accelerator");
        match (self.build)(&staged, accelerator) {
            Ok(model) => {
                let staged = (policy == EvictionPolicy::Host).then_some(staged);
                self.slot = Slot::Accelerator { model, staged };
                Ok(())
            }
            Err(e) => {
                if policy == EvictionPolicy::Host {
                    self.slot = Slot::Host(staged);
                }
                Err(e)
            }
        }
    }

    fn evict(&mut self, policy: EvictionPolicy) -> Result<()> {
        match (std::mem::replace(&mut self.slot, Slot::Unloaded), policy) {
            (Slot::Accelerator { model, staged }, EvictionPolicy::Host) => {
                drop(model);
                tracing::debug!(component = %self.kind, "moving to host");
                let staged = match staged {
                    Some(staged) => staged,
                    None => (self.stage)()?,
                };
                self.slot = Slot::Host(staged);
            }
            (Slot::Host(staged), EvictionPolicy::Host) => self.slot = Slot::Host(staged),
            (Slot::Unloaded, _) => {}
            (_, EvictionPolicy::Unload) => {
                tracing::debug!(component = %self.kind, "unloading");
            }
        }
        Ok(())
    }
}

/// Identity of a diffusion checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointId {
    pub name: String,
    pub path: PathBuf,
}

impl CheckpointId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { name, path }
    }
}

/// A diffusion pipeline whose weights are managed by the registry.
pub struct LoadedPipeline {
    pub id: CheckpointId,
    /// Pipeline variant; the orchestrator only drives the regional one.
    pub kind: &'static str,
    pub tokenizer: Box<dyn Tokenize>,
    pub tokenizer_2: Box<dyn Tokenize>,
    pub text_encoder: Component<Box<dyn TextEncoder>>,
    pub text_encoder_2: Component<Box<dyn TextEncoder>>,
    pub unet: Component<Box<dyn NoisePredictor>>,
    pub vae: Component<Box<dyn LatentCodec>>,
    pub lora: Option<LoraSelection>,
}

impl LoadedPipeline {
    fn components_mut(&mut self) -> [&mut dyn Movable; 4] {
        [
            &mut self.text_encoder,
            &mut self.text_encoder_2,
            &mut self.vae,
            &mut self.unet,
        ]
    }

    fn components(&self) -> [&dyn Movable; 4] {
        [
            &self.text_encoder,
            &self.text_encoder_2,
            &self.vae,
            &self.unet,
        ]
    }
}

/// Builds diffusion pipelines. Checkpoint discovery lives with the caller.
pub trait PipelineLoader {
    fn load(&self, id: &CheckpointId) -> Result<LoadedPipeline>;

    /// Records the LoRA selection on the pipeline; `None` clears it.
    fn apply_lora(&self, pipeline: &mut LoadedPipeline, lora: Option<LoraSelection>) -> Result<()> {
        pipeline.lora = lora;
        Ok(())
    }
}

/// Language model shared between the registry and the chat worker.
pub type SharedLm = Arc<Mutex<Box<dyn CausalLm + Send>>>;

/// Owns the single loaded pipeline, the LLM and their placements.
pub struct ModelRegistry {
    device: Device,
    policy: EvictionPolicy,
    pipeline: Option<LoadedPipeline>,
    llm: Option<Component<SharedLm>>,
}

impl ModelRegistry {
    pub fn new(device: Device, policy: EvictionPolicy) -> Self {
        Self {
            device,
            policy,
            pipeline: None,
            llm: None,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub fn register_llm(&mut self, llm: Component<SharedLm>) {
        self.llm = Some(llm);
    }

    pub fn pipeline(&self) -> Result<&LoadedPipeline> {
        self.pipeline.as_ref().ok_or(Error::NoPipeline)
    }

    pub fn pipeline_mut(&mut self) -> Result<&mut LoadedPipeline> {
        self.pipeline.as_mut().ok_or(Error::NoPipeline)
    }

    /// A handle on the LLM for the chat worker; it must be resident.
    pub fn llm(&self) -> Result<SharedLm> {
        match &self.llm {
            Some(llm) => llm.get().cloned(),
            None => Err(Error::ResidencyViolation {
                component: ComponentKind::Llm,
                found: Residency::Unloaded,
            }),
        }
    }

    /// Current placement of a component; untracked components are unloaded.
    pub fn residency(&self, kind: ComponentKind) -> Residency {
        self.tracked()
            .into_iter()
            .find(|c| c.kind() == kind)
            .map_or(Residency::Unloaded, |c| c.residency())
    }

    /// Bytes currently placed on the accelerator.
    pub fn resident_bytes(&self) -> u64 {
        self.tracked()
            .into_iter()
            .filter(|c| c.residency() == Residency::Accelerator)
            .map(|c| c.footprint())
            .sum()
    }

    fn tracked(&self) -> Vec<&dyn Movable> {
        let mut out: Vec<&dyn Movable> = Vec::new();
        if let Some(pipeline) = &self.pipeline {
            out.extend(pipeline.components());
        }
        if let Some(llm) = &self.llm {
            out.push(llm);
        }
        out
    }

    fn tracked_mut(&mut self) -> Vec<&mut dyn Movable> {
        let mut out: Vec<&mut dyn Movable> = Vec::new();
        if let Some(pipeline) = &mut self.pipeline {
            out.extend(pipeline.components_mut());
        }
        if let Some(llm) = &mut self.llm {
            out.push(llm);
        }
        out
    }

    /// Places exactly `wanted` on the accelerator.
    ///
    /// Every tracked component outside `wanted` is evicted before anything is
    /// loaded. After placement the device is synchronized so freed buffers are
    /// returned, and the placement table is checked. Idempotent; an empty set
    /// evicts everything.
    pub fn ensure_resident(&mut self, wanted: &[ComponentKind]) -> Result<()> {
        let policy = self.policy;
        for component in self.tracked_mut() {
            if !wanted.contains(&component.kind()) {
                component.evict(policy)?;
            }
        }
        self.device.synchronize()?;

        for kind in wanted {
            let device = self.device.clone();
            let mut tracked = self.tracked_mut();
            let component = tracked
                .iter_mut()
                .find(|c| c.kind() == *kind)
                .ok_or_else(|| missing(*kind))?;
            component.place(&device, policy)?;
        }
        self.device.synchronize()?;

        for component in self.tracked() {
            let on_accelerator = component.residency() == Residency::Accelerator;
            if on_accelerator != wanted.contains(&component.kind()) {
                return Err(Error::ResidencyViolation {
                    component: component.kind(),
                    found: component.residency(),
                });
            }
        }
        tracing::debug!(
            components = ?wanted,
            bytes = self.resident_bytes(),
            "residency updated"
        );
        Ok(())
    }

    /// Makes `id` the loaded pipeline.
    ///
    /// A different checkpoint fully unloads the current pipeline before the
    /// next is built, so two pipelines never coexist. The same checkpoint only
    /// has its LoRA selection re-applied.
    pub fn select_checkpoint(
        &mut self,
        loader: &dyn PipelineLoader,
        id: &CheckpointId,
        lora: Option<LoraSelection>,
    ) -> Result<()> {
        if let Some(pipeline) = self.pipeline.as_mut().filter(|p| p.id == *id) {
            if pipeline.lora != lora {
                tracing::info!(checkpoint = %id.name, "re-applying lora selection");
                loader.apply_lora(pipeline, lora)?;
            }
            return Ok(());
        }
        if let Some(previous) = self.pipeline.take() {
            tracing::info!(checkpoint = %previous.id.name, "unloading pipeline");
            drop(previous);
            self.device.synchronize()?;
        }
        tracing::info!(checkpoint = %id.name, "loading pipeline");
        let mut pipeline = loader.load(id)?;
        loader.apply_lora(&mut pipeline, lora)?;
        self.pipeline = Some(pipeline);
        Ok(())
    }
}

fn missing(kind: ComponentKind) -> Error {
    match kind {
        ComponentKind::Llm => Error::ResidencyViolation {
            component: kind,
            found: Residency::Unloaded,
        },
        _ => Error::NoPipeline,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted(kind: ComponentKind, reads: Arc<AtomicUsize>, builds: Arc<AtomicUsize>) -> Component<u32> {
        Component::new(
            kind,
            DType::F32,
            1 << 20,
            Box::new(move || {
                reads.fetch_add(1, Ordering::SeqCst);
                Ok(HostWeights::Bytes(vec![7]))
            }),
            Box::new(move |staged, _device| {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(staged.bytes()?[0] as u32)
            }),
        )
    }

    #[test]
    fn unplaced_component_is_a_violation() {
        let c = counted(ComponentKind::Vae, Arc::default(), Arc::default());
        assert_eq!(c.residency(), Residency::Unloaded);
        match c.get() {
            Err(Error::ResidencyViolation { component, found }) => {
                assert_eq!(component, ComponentKind::Vae);
                assert_eq!(found, Residency::Unloaded);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn place_is_idempotent() -> Result<()> {
        let (reads, builds) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let mut c = counted(ComponentKind::Unet, reads.clone(), builds.clone());
        c.place(&Device::Cpu, EvictionPolicy::Unload)?;
        c.place(&Device::Cpu, EvictionPolicy::Unload)?;
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(*c.get()?, 7);
        Ok(())
    }

    #[test]
    fn host_eviction_reuses_the_staged_weights() -> Result<()> {
        let (reads, builds) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let mut c = counted(ComponentKind::TextEncoder, reads.clone(), builds.clone());
        for _ in 0..3 {
            c.place(&Device::Cpu, EvictionPolicy::Host)?;
            assert_eq!(*c.get()?, 7);
            c.evict(EvictionPolicy::Host)?;
            assert_eq!(Movable::residency(&c), Residency::Host);
            assert!(c.get().is_err());
        }
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(builds.load(Ordering::SeqCst), 3);

        c.evict(EvictionPolicy::Unload)?;
        assert_eq!(Movable::residency(&c), Residency::Unloaded);
        c.place(&Device::Cpu, EvictionPolicy::Host)?;
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn unload_eviction_reads_again() -> Result<()> {
        let (reads, builds) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let mut c = counted(ComponentKind::Unet, reads.clone(), builds.clone());
        c.place(&Device::Cpu, EvictionPolicy::Unload)?;
        c.evict(EvictionPolicy::Unload)?;
        c.place(&Device::Cpu, EvictionPolicy::Unload)?;
        assert_eq!(reads.load(Ordering::SeqCst), 2);

        // Placed without a host copy, a host eviction stages one.
        c.evict(EvictionPolicy::Host)?;
        assert_eq!(Movable::residency(&c), Residency::Host);
        assert_eq!(reads.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[test]
    fn failed_build_keeps_the_host_copy() -> Result<()> {
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = reads.clone();
        let mut c: Component<u32> = Component::new(
            ComponentKind::Vae,
            DType::F32,
            1,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(HostWeights::Tensors(HashMap::new()))
            }),
            Box::new(|staged, _device| Ok(staged.bytes()?.len() as u32)),
        );
        assert!(c.place(&Device::Cpu, EvictionPolicy::Host).is_err());
        assert_eq!(Movable::residency(&c), Residency::Host);
        assert!(c.place(&Device::Cpu, EvictionPolicy::Unload).is_err());
        assert_eq!(Movable::residency(&c), Residency::Unloaded);
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        Ok(())
    }

    fn llm_component(loads: Arc<AtomicUsize>) -> Component<SharedLm> {
        struct Silent;
        impl CausalLm for Silent {
            fn forward(&mut self, _tokens: &[u32], _pos: usize) -> Result<candle::Tensor> {
                Ok(candle::Tensor::zeros(4, DType::F32, &Device::Cpu)?)
            }
        }
        Component::new(
            ComponentKind::Llm,
            DType::F32,
            1 << 30,
            Box::new(move || {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(HostWeights::Bytes(Vec::new()))
            }),
            Box::new(|_staged, _device| {
                let lm: Box<dyn CausalLm + Send> = Box::new(Silent);
                Ok(Arc::new(Mutex::new(lm)))
            }),
        )
    }

    #[test]
    fn registry_llm_round_trip() -> Result<()> {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut registry = ModelRegistry::new(Device::Cpu, EvictionPolicy::Unload);
        registry.register_llm(llm_component(loads.clone()));
        assert!(registry.llm().is_err());

        registry.ensure_resident(&[ComponentKind::Llm])?;
        assert_eq!(registry.residency(ComponentKind::Llm), Residency::Accelerator);
        assert!(registry.llm().is_ok());
        assert_eq!(registry.resident_bytes(), 1 << 30);

        registry.ensure_resident(&[])?;
        assert_eq!(registry.residency(ComponentKind::Llm), Residency::Unloaded);
        assert_eq!(registry.resident_bytes(), 0);
        registry.ensure_resident(&[])?;
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn host_policy_registry_reads_once() -> Result<()> {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut registry = ModelRegistry::new(Device::Cpu, EvictionPolicy::Host);
        registry.register_llm(llm_component(loads.clone()));
        for _ in 0..3 {
            registry.ensure_resident(&[ComponentKind::Llm])?;
            assert!(registry.llm().is_ok());
            registry.ensure_resident(&[])?;
            assert_eq!(registry.residency(ComponentKind::Llm), Residency::Host);
            assert_eq!(registry.resident_bytes(), 0);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn pipeline_components_need_a_pipeline() {
        let mut registry = ModelRegistry::new(Device::Cpu, EvictionPolicy::Unload);
        assert!(matches!(
            registry.ensure_resident(&[ComponentKind::Unet]),
            Err(Error::NoPipeline)
        ));
        assert!(matches!(registry.pipeline(), Err(Error::NoPipeline)));
    }

    #[test]
    fn checkpoint_name_is_the_file_name() {
        let id = CheckpointId::new("/models/sdxl/juggernaut");
        assert_eq!(id.name, "juggernaut");
        assert_eq!(ComponentKind::TextEncoder2.to_string(), "text_encoder_2");
        assert_eq!(Residency::Host.to_string(), "in host memory");
    }
}
