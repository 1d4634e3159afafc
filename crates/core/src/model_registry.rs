use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_MODEL_COST: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ModelCategory {
    ImageGeneration,
    VideoGeneration,
    ImageEditing,
    BackgroundRemoval,
    Upscaling,
    TextGeneration,
}

impl std::fmt::Display for ModelCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ImageGeneration => write!(f, "image-generation"),
            Self::VideoGeneration => write!(f, "video-generation"),
            Self::ImageEditing => write!(f, "image-editing"),
            Self::BackgroundRemoval => write!(f, "background-removal"),
            Self::Upscaling => write!(f, "upscaling"),
            Self::TextGeneration => write!(f, "text-generation"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    /// `owner/name` identifier as understood by the model runner.
    pub model_id: String,
    pub name: String,
    pub category: ModelCategory,
    /// Declared credits per prediction. Fractions are truncated when billed.
    pub cost_per_run: f64,
    #[serde(default)]
    pub description: String,
}

/// Source of per-model pricing and the model listing.
pub trait ModelCatalog: Send + Sync {
    fn cost_per_run(&self, model_id: &str) -> Option<f64>;

    /// Credits charged for a model the catalog does not know.
    fn default_cost(&self) -> i64;

    fn list(&self) -> Vec<ModelEntry>;
}

fn entry(model_id: &str, name: &str, category: ModelCategory, cost: f64, description: &str) -> ModelEntry {
    ModelEntry {
        model_id: model_id.into(),
        name: name.into(),
        category,
        cost_per_run: cost,
        description: description.into(),
    }
}

fn builtin_catalog() -> Vec<ModelEntry> {
    use ModelCategory::*;

    vec![
        entry("black-forest-labs/flux-1.1-pro", "Flux 1.1 Pro", ImageGeneration, 2.0, "Fast FLUX Pro with strong prompt adherence"),
        entry("black-forest-labs/flux-1.1-pro-ultra", "Flux 1.1 Pro Ultra", ImageGeneration, 3.0, "4MP images with raw mode"),
        entry("stability-ai/sdxl", "Stable Diffusion XL", ImageGeneration, 1.0, "Detailed general purpose image generation"),
        entry("google/imagen-4", "Google Imagen 4", ImageGeneration, 2.0, "Flagship image generation"),
        entry("google/imagen-4-fast", "Google Imagen 4 Fast", ImageGeneration, 1.0, "Imagen 4 tuned for speed"),
        entry("ideogram-ai/ideogram-v3-turbo", "Ideogram V3 Turbo", ImageGeneration, 1.0, "Good text rendering"),
        entry("recraft-ai/recraft-v3", "Recraft V3", ImageGeneration, 4.0, "Long text generation inside images"),
        entry("google/veo-3.1", "Google Veo 3.1", VideoGeneration, 10.0, "Video with context-aware audio"),
        entry("google/veo-3.1-fast", "Google Veo 3.1 Fast", VideoGeneration, 6.0, "Cheaper Veo 3.1"),
        entry("luma/ray-2-720p", "Luma Ray 2 (720p)", VideoGeneration, 8.0, "5s and 9s 720p clips"),
        entry("luma/ray-flash-2-720p", "Luma Ray Flash 2 (720p)", VideoGeneration, 5.0, "Cheaper Ray 2"),
        entry("minimax/video-01", "Minimax Video-01", VideoGeneration, 8.0, "6s clips from a prompt or image"),
        entry("runwayml/gen4-turbo", "Runway Gen-4 Turbo", VideoGeneration, 10.0, "5s and 10s 720p clips"),
        entry("black-forest-labs/flux-fill-pro", "Flux Fill Pro", ImageEditing, 2.0, "Inpainting and outpainting"),
        entry("black-forest-labs/flux-kontext-pro", "Flux Kontext Pro", ImageEditing, 2.0, "Instruction based image editing"),
        entry("google/nano-banana-pro", "Google Nano Banana Pro", ImageEditing, 2.0, "Image editing"),
        entry("ideogram-ai/ideogram-v2", "Ideogram V2", ImageEditing, 1.0, "Inpainting with good prompt comprehension"),
        entry("recraft-ai/recraft-remove-background", "Recraft Background Removal", BackgroundRemoval, 1.0, "Automated background removal"),
        entry("bria/remove-background", "Bria Remove Background", BackgroundRemoval, 1.0, "Commercial background removal"),
        entry("nightmareai/real-esrgan", "Real-ESRGAN", Upscaling, 1.0, "Image upscaling with face correction"),
        entry("philz1337x/crystal-upscaler", "Crystal Upscaler", Upscaling, 2.0, "High fidelity portrait upscaling"),
        entry("topazlabs/image-upscale", "Topaz Image Upscale", Upscaling, 3.0, "Professional image upscaling"),
        entry("openai/gpt-4o-mini", "GPT-4o mini", TextGeneration, 1.0, "Titles, hooks and script drafts"),
    ]
}

/// In-process model catalog: the curated list plus entries from configuration.
#[derive(Debug, Clone)]
pub struct StaticModelCatalog {
    entries: Vec<ModelEntry>,
    default_cost: i64,
}

impl StaticModelCatalog {
    pub fn new(entries: Vec<ModelEntry>, default_cost: i64) -> Self {
        Self {
            entries,
            default_cost,
        }
    }

    pub fn with_builtin_models() -> Self {
        Self::new(builtin_catalog(), DEFAULT_MODEL_COST)
    }

    pub fn with_default_cost(mut self, default_cost: i64) -> Self {
        self.default_cost = default_cost;
        self
    }

    /// Replace entries with the same `model_id`, append the rest.
    pub fn apply_overrides(&mut self, overrides: &[ModelEntry]) {
        for entry in overrides {
            match self
                .entries
                .iter_mut()
                .find(|existing| existing.model_id == entry.model_id)
            {
                Some(existing) => *existing = entry.clone(),
                None => {
                    info!(model_id = %entry.model_id, "Registered model from config");
                    self.entries.push(entry.clone());
                }
            }
        }
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.model_id == model_id)
    }

    pub fn list_by_category(&self, category: ModelCategory) -> Vec<&ModelEntry> {
        self.entries
            .iter()
            .filter(|e| e.category == category)
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("Failed to serialize model catalog")
    }
}

impl Default for StaticModelCatalog {
    fn default() -> Self {
        Self::with_builtin_models()
    }
}

impl ModelCatalog for StaticModelCatalog {
    fn cost_per_run(&self, model_id: &str) -> Option<f64> {
        self.get(model_id).map(|e| e.cost_per_run)
    }

    fn default_cost(&self) -> i64 {
        self.default_cost
    }

    fn list(&self) -> Vec<ModelEntry> {
        self.entries.clone()
    }
}
