//! Region canvas model.
//!
//! A [`Canvas`] is the layout an LLM describes: a full-canvas background
//! followed by rectangular regions, each with its own prompt and optional
//! color. Regions paint over each other in index order (painter's algorithm),
//! so a region's `z_order` is its position in [`Canvas::regions`].
//!
//! Bounds live on a fixed [`CANVAS_GRID`]×[`CANVAS_GRID`] grid independent of
//! the output resolution; [`grid::render_to_grid`] rasterizes them at any
//! pixel size.

pub mod grammar;
pub mod grid;
pub mod vocab;

pub use grammar::{CanvasGrammar, CodeBlockGrammar};
pub use grid::{render_to_grid, RegionGrid};

use crate::{Error, Result};

/// Extent of the canvas grid along each axis.
pub const CANVAS_GRID: u32 = 90;

/// Resolutions are floored to multiples of this.
pub const RESOLUTION_MULTIPLE: usize = 64;

pub type Rgb = [u8; 3];

/// Half-open rectangle `[x0, x1) × [y0, y1)` in canvas grid units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl GridRect {
    pub const FULL: GridRect = GridRect {
        x0: 0,
        y0: 0,
        x1: CANVAS_GRID,
        y1: CANVAS_GRID,
    };

    /// Fails on empty rectangles and on bounds outside the grid.
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Result<Self> {
        if x1 <= x0 || y1 <= y0 {
            return Err(Error::MalformedCanvas(format!(
                "degenerate region bounds ({x0}, {y0}, {x1}, {y1})"
            )));
        }
        if x1 > CANVAS_GRID || y1 > CANVAS_GRID {
            return Err(Error::MalformedCanvas(format!(
                "region bounds ({x0}, {y0}, {x1}, {y1}) exceed the {CANVAS_GRID}x{CANVAS_GRID} canvas"
            )));
        }
        Ok(Self { x0, y0, x1, y1 })
    }

    /// Rectangle of size `(w, h)` centred on `(cx, cy)`, clamped to the grid.
    pub fn centred(cx: i32, cy: i32, w: i32, h: i32) -> Result<Self> {
        let clamp = |v: i32| v.clamp(0, CANVAS_GRID as i32) as u32;
        Self::new(
            clamp(cx - w / 2),
            clamp(cy - h / 2),
            clamp(cx + w / 2),
            clamp(cy + h / 2),
        )
    }

    pub fn area(&self) -> u32 {
        (self.x1 - self.x0) * (self.y1 - self.y0)
    }

    /// Whether the grid-space point lies inside the rectangle.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x0 as f64 && x < self.x1 as f64 && y >= self.y0 as f64 && y < self.y1 as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub bounds: GridRect,
    pub description: String,
    pub fixed_color: Option<Rgb>,
    pub z_order: u32,
    /// Larger is further away. Only set for regions that came from the LLM.
    pub distance_to_viewer: Option<f32>,
}

/// An immutable, parsed layout. Region 0 is always the full-canvas background.
#[derive(Debug, Clone, PartialEq)]
pub struct Canvas {
    regions: Vec<Region>,
    negative_prompt: String,
    width: usize,
    height: usize,
}

impl Canvas {
    pub fn builder() -> CanvasBuilder {
        CanvasBuilder::default()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn background(&self) -> &Region {
        &self.regions[0]
    }

    pub fn negative_prompt(&self) -> &str {
        &self.negative_prompt
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// The same layout targeted at another resolution.
    pub fn at_resolution(self, width: usize, height: usize) -> Result<Self> {
        let (width, height) = floor_resolution(width, height)?;
        Ok(Self {
            width,
            height,
            ..self
        })
    }

    /// Parses an LLM response with the given grammar.
    pub fn from_response(raw: &str, grammar: &dyn CanvasGrammar) -> ParseOutcome {
        let outcome = grammar.parse(raw);
        match &outcome {
            ParseOutcome::Valid(canvas) => tracing::debug!(
                grammar = grammar.version(),
                regions = canvas.regions.len(),
                "parsed canvas"
            ),
            ParseOutcome::Malformed(reason) => {
                tracing::warn!(grammar = grammar.version(), "response is not a valid canvas: {reason}")
            }
            ParseOutcome::NoCanvas => {}
        }
        outcome
    }
}

/// Parses an LLM response with the default grammar.
///
/// Responses without canvas markup and responses whose markup is unusable
/// both fail with [`Error::MalformedCanvas`]; use [`Canvas::from_response`]
/// to tell them apart.
pub fn parse(raw: &str) -> Result<Canvas> {
    Canvas::from_response(raw, &CodeBlockGrammar).into_result()
}

/// Floors both sides to a multiple of 64, rejecting anything that ends up empty.
pub fn floor_resolution(width: usize, height: usize) -> Result<(usize, usize)> {
    let floor = |v: usize| v / RESOLUTION_MULTIPLE * RESOLUTION_MULTIPLE;
    let (w, h) = (floor(width), floor(height));
    if w == 0 || h == 0 {
        return Err(Error::invalid(
            "resolution",
            format!("{width}x{height} is smaller than {RESOLUTION_MULTIPLE}x{RESOLUTION_MULTIPLE}"),
        ));
    }
    Ok((w, h))
}

/// Result of looking for a canvas in an LLM response.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// The response carries no canvas markup at all.
    NoCanvas,
    /// Canvas markup is present but unusable.
    Malformed(String),
    Valid(Canvas),
}

impl ParseOutcome {
    /// Whether the render action should be enabled for this response.
    pub fn renderable(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    pub fn canvas(&self) -> Option<&Canvas> {
        match self {
            Self::Valid(canvas) => Some(canvas),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<Canvas> {
        match self {
            Self::Valid(canvas) => Ok(canvas),
            Self::Malformed(reason) => Err(Error::MalformedCanvas(reason)),
            Self::NoCanvas => Err(Error::MalformedCanvas(
                "response contains no canvas markup".to_string(),
            )),
        }
    }
}

/// Builds a [`Canvas`], assigning paint order from insertion order.
#[derive(Debug, Clone)]
pub struct CanvasBuilder {
    background: Option<(String, Option<Rgb>)>,
    regions: Vec<(GridRect, String, Option<Rgb>, Option<f32>)>,
    negative_prompt: String,
    width: usize,
    height: usize,
}

impl Default for CanvasBuilder {
    fn default() -> Self {
        Self {
            background: None,
            regions: Vec::new(),
            negative_prompt: String::new(),
            width: 1024,
            height: 1024,
        }
    }
}

impl CanvasBuilder {
    pub fn background(mut self, description: impl Into<String>, color: Option<Rgb>) -> Self {
        self.background = Some((description.into(), color));
        self
    }

    /// Adds a region painted over every region added before it.
    pub fn region(mut self, bounds: GridRect, description: impl Into<String>, color: Option<Rgb>) -> Self {
        self.regions.push((bounds, description.into(), color, None));
        self
    }

    pub(crate) fn region_at_distance(
        mut self,
        bounds: GridRect,
        description: String,
        color: Option<Rgb>,
        distance: f32,
    ) -> Self {
        self.regions.push((bounds, description, color, Some(distance)));
        self
    }

    pub fn negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
        self.negative_prompt = negative_prompt.into();
        self
    }

    pub fn resolution(mut self, width: usize, height: usize) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Without an explicit background an empty one is inserted.
    pub fn build(self) -> Result<Canvas> {
        let (width, height) = floor_resolution(self.width, self.height)?;
        let (description, fixed_color) = self.background.unwrap_or_default();
        let mut regions = vec![Region {
            bounds: GridRect::FULL,
            description,
            fixed_color,
            z_order: 0,
            distance_to_viewer: None,
        }];
        for (bounds, description, fixed_color, distance_to_viewer) in self.regions {
            regions.push(Region {
                bounds,
                description,
                fixed_color,
                z_order: regions.len() as u32,
                distance_to_viewer,
            });
        }
        Ok(Canvas {
            regions,
            negative_prompt: self.negative_prompt,
            width,
            height,
        })
    }
}
