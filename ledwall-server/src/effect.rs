//! Built-in effects.
//!
//! An effect paints one full-wall frame at a time into a fresh [`Canvas`].
//! Colour math stays here; the rest of the server only sees frames.

use serde::{Deserialize, Serialize};

use ledwall_core::{Canvas, Rgb};

/// A frame generator.
pub trait Effect: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Paint frame number `frame_no` of this effect.
    fn draw(&mut self, frame_no: u64, canvas: &mut Canvas);
}

/// Effects selectable from the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    Grid,
    Rainbow,
    Twist,
    Solid,
}

impl EffectKind {
    /// Instantiate the effect. `color` is used by [`EffectKind::Solid`] only.
    pub fn build(self, color: Option<Rgb>) -> Box<dyn Effect> {
        match self {
            Self::Grid => Box::new(TestGrid),
            Self::Rainbow => Box::new(RainbowBands),
            Self::Twist => Box::new(RainbowTwist),
            Self::Solid => Box::new(Solid(color.unwrap_or(Rgb::new(0xff, 0xff, 0xff)))),
        }
    }
}

// ── Effects ──────────────────────────────────────────────────────

/// Green grid for checking panel alignment.
#[derive(Debug, Default)]
pub struct TestGrid;

impl Effect for TestGrid {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn draw(&mut self, _frame_no: u64, canvas: &mut Canvas) {
        for y in 0..canvas.height() {
            for x in 0..canvas.width() {
                if x % 8 == 0 || y % 8 == 6 {
                    canvas.set(x, y, Rgb::new(0x00, 0xff, 0x00));
                }
            }
        }
    }
}

/// One full hue cycle down every slice.
#[derive(Debug, Default)]
pub struct RainbowBands;

impl Effect for RainbowBands {
    fn name(&self) -> &'static str {
        "rainbow"
    }

    fn draw(&mut self, _frame_no: u64, canvas: &mut Canvas) {
        let band = canvas.geometry().slice_height;
        for y in 0..canvas.height() {
            let color = hue((y % band) * 360 / band);
            for x in 0..canvas.width() {
                canvas.set(x, y, color);
            }
        }
    }
}

/// Diagonal hue bands drifting one column per frame.
#[derive(Debug, Default)]
pub struct RainbowTwist;

impl Effect for RainbowTwist {
    fn name(&self) -> &'static str {
        "twist"
    }

    fn draw(&mut self, frame_no: u64, canvas: &mut Canvas) {
        let band = canvas.geometry().slice_height;
        let shift = (frame_no % band as u64) as usize;
        for y in 0..canvas.height() {
            for x in 0..canvas.width() {
                let color = hue(((x + y + shift) % band) * 360 / band);
                canvas.set(x, y, color);
            }
        }
    }
}

/// Every pixel the same colour.
#[derive(Debug)]
pub struct Solid(pub Rgb);

impl Effect for Solid {
    fn name(&self) -> &'static str {
        "solid"
    }

    fn draw(&mut self, _frame_no: u64, canvas: &mut Canvas) {
        canvas.fill(self.0);
    }
}

/// Fully saturated, full brightness colour at `degrees` on the hue wheel.
pub fn hue(degrees: usize) -> Rgb {
    let h = degrees % 360;
    let rise = ((h % 60) * 255 / 60) as u8;
    let fall = 255 - rise;
    match h / 60 {
        0 => Rgb::new(255, rise, 0),
        1 => Rgb::new(fall, 255, 0),
        2 => Rgb::new(0, 255, rise),
        3 => Rgb::new(0, fall, 255),
        4 => Rgb::new(rise, 0, 255),
        _ => Rgb::new(255, 0, fall),
    }
}

// ── Tests ────────────────────────────────────────────────────────
