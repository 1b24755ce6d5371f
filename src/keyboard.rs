//! On-screen keyboards.
//!
//! Typing is a sequence of taps, one per key. Text is split into keys by
//! [`parse_keys`]: every character is a key of its own, and a name between
//! square brackets (`[Enter]`, `[Shift]`) is a single special key.
//!
//! Where the keyboard sits on the screen and where each key sits on the
//! keyboard are answered by a [`KeyLocator`]. [`LayoutKeys`] is the stock
//! locator: it finds the keyboard image with a [`Matcher`] and places keys
//! from a [`KeyboardLayout`].

use crate::error::{RigError, RigResult};
use crate::geometry::Region;
use crate::script::{MatchResult, Matcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Split typed text into keys.
///
/// `[` opens a special key name that runs to the next `]`. An empty name
/// takes the `]` itself, so `[]]` types a closing bracket. An unterminated
/// name is rejected.
pub fn parse_keys(text: &str) -> RigResult<Vec<String>> {
    let mut keys = Vec::new();
    let mut escape: Option<String> = None;

    for c in text.chars() {
        if let Some(mut name) = escape.take() {
            if c == ']' && !name.is_empty() {
                keys.push(name);
            } else {
                name.push(c);
                escape = Some(name);
            }
        } else if c == '[' {
            escape = Some(String::new());
        } else {
            keys.push(c.to_string());
        }
    }

    if let Some(name) = escape {
        return Err(RigError::InvalidKeyText(format!(
            "unterminated key name '[{name}' in {text:?}"
        )));
    }
    Ok(keys)
}

/// Keyboard bounding box in screen pixels, from its top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KeyboardArea {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl KeyboardArea {
    /// Box of a match result, whose coordinates are the centre.
    pub fn from_match(result: &MatchResult) -> Self {
        Self {
            x: result.x - result.w / 2.0,
            y: result.y - result.h / 2.0,
            w: result.w,
            h: result.h,
        }
    }

    /// Whether the box lies strictly inside a `width` x `height` screen.
    pub fn is_inside(&self, width: f64, height: f64) -> bool {
        self.x > 0.0 && self.y > 0.0 && self.x + self.w < width && self.y + self.h < height
    }

    /// Screen point at fractional position `(fx, fy)` of the box.
    pub fn point(&self, fx: f64, fy: f64) -> (f64, f64) {
        (self.x + self.w * fx, self.y + self.h * fy)
    }
}

/// Finds keyboards on the screen and keys on a keyboard.
pub trait KeyLocator {
    /// Locate keyboard `keyboard` in `photo`. The result carries the centre
    /// and size in screen pixels, like a widget match.
    fn locate_keyboard(&mut self, keyboard: &str, photo: &Path) -> RigResult<MatchResult>;

    /// Screen position of `key` on `keyboard` occupying `area`. `None` when the
    /// keyboard has no such key.
    fn key_position(&self, keyboard: &str, key: &str, area: KeyboardArea) -> RigResult<Option<(f64, f64)>>;
}

/// A block of equally wide keys, laid out row by row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyBlock {
    /// `[left, top, right, bottom]` as fractions of the keyboard.
    pub region: [f64; 4],
    pub rows: Vec<Vec<String>>,
}

impl KeyBlock {
    fn find(&self, key: &str) -> Option<(f64, f64)> {
        let [left, top, right, bottom] = self.region;
        let row_count = self.rows.len() as f64;
        self.rows.iter().enumerate().find_map(|(r, row)| {
            let c = row.iter().position(|k| k.to_lowercase() == key.to_lowercase())?;
            let fx = (c as f64 + 0.5) / row.len() as f64;
            let fy = (r as f64 + 0.5) / row_count;
            Some((left + (right - left) * fx, top + (bottom - top) * fy))
        })
    }
}

/// Key positions of one keyboard, as fractions of the keyboard image.
///
/// Stored as JSON:
///
/// ```json
/// { "blocks": [ { "region": [0.0, 0.0, 1.0, 0.75],
///                 "rows": [["q", "w", "e"], ["a", "s", "d"]] } ] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyboardLayout {
    pub blocks: Vec<KeyBlock>,
}

impl KeyboardLayout {
    pub fn load<P: AsRef<Path>>(path: P) -> RigResult<Self> {
        let path = path.as_ref();
        let layout: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        debug!(path = %path.display(), blocks = layout.blocks.len(), "Loaded keyboard layout");
        Ok(layout)
    }

    /// Fractional position of `key`, compared case-insensitively. The first
    /// block holding the key wins.
    pub fn key_offset(&self, key: &str) -> Option<(f64, f64)> {
        self.blocks.iter().find_map(|block| block.find(key))
    }
}

struct KeyboardModel {
    template: String,
    layout: KeyboardLayout,
}

/// [`KeyLocator`] backed by a template matcher and per-keyboard layouts.
pub struct LayoutKeys<M: Matcher> {
    matcher: M,
    keyboards: HashMap<String, KeyboardModel>,
}

impl<M: Matcher> LayoutKeys<M> {
    pub fn new(matcher: M) -> Self {
        Self {
            matcher,
            keyboards: HashMap::new(),
        }
    }

    /// Register `keyboard`, found on screen by matching `template`.
    pub fn insert(&mut self, keyboard: &str, template: impl Into<String>, layout: KeyboardLayout) {
        self.keyboards.insert(
            keyboard.to_string(),
            KeyboardModel {
                template: template.into(),
                layout,
            },
        );
    }

    /// Register every keyboard under `dir`: each subdirectory holding a
    /// `keyboard.png` template and a `layout.json`.
    pub fn load_dir<P: AsRef<Path>>(&mut self, dir: P) -> RigResult<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            let template = path.join("keyboard.png");
            let layout = path.join("layout.json");
            if !(template.is_file() && layout.is_file()) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let layout = KeyboardLayout::load(&layout)?;
            self.insert(name, path_string(template), layout);
            loaded += 1;
        }
        info!(dir = %dir.as_ref().display(), keyboards = loaded, "Loaded keyboards");
        Ok(loaded)
    }

    fn model(&self, keyboard: &str) -> RigResult<&KeyboardModel> {
        self.keyboards
            .get(keyboard)
            .ok_or_else(|| RigError::Configuration(format!("no layout for keyboard '{keyboard}'")))
    }
}

fn path_string(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

impl<M: Matcher> KeyLocator for LayoutKeys<M> {
    fn locate_keyboard(&mut self, keyboard: &str, photo: &Path) -> RigResult<MatchResult> {
        let template = self.model(keyboard)?.template.clone();
        self.matcher.locate(&template, photo, Region::FULL)
    }

    fn key_position(&self, keyboard: &str, key: &str, area: KeyboardArea) -> RigResult<Option<(f64, f64)>> {
        Ok(self
            .model(keyboard)?
            .layout
            .key_offset(key)
            .map(|(fx, fy)| area.point(fx, fy)))
    }
}
