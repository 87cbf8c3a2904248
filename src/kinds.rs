//! Drawable object kinds and their field schemas
//!
//! The set of kinds is closed: every object advertised over the wire is one
//! of `{mesh, points, arrows, lines, text}`, and each kind carries a fixed,
//! ordered field set laid down at creation. Optional arrays (colormap
//! fields, texture coordinates) that were not supplied still get a segment,
//! holding the scalar-NaN placeholder, so the field set never changes after
//! the handshake.

use crate::error::{Result, SimlinkError};
use crate::field::FieldValue;

/// Fixed capacity for styling strings (colors, colormap names, fonts)
pub const STR_CAPACITY: usize = 64;
/// Fixed capacity for text content (100 chars at up to 4 UTF-8 bytes each)
pub const TEXT_CAPACITY: usize = 400;

/// The closed set of drawable kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Mesh,
    Points,
    Arrows,
    Lines,
    Text,
}

impl ObjectKind {
    /// Stable tag used in the handshake
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Mesh => "mesh",
            ObjectKind::Points => "points",
            ObjectKind::Arrows => "arrows",
            ObjectKind::Lines => "lines",
            ObjectKind::Text => "text",
        }
    }

    pub fn parse(tag: &str) -> Result<Self> {
        match tag {
            "mesh" => Ok(ObjectKind::Mesh),
            "points" => Ok(ObjectKind::Points),
            "arrows" => Ok(ObjectKind::Arrows),
            "lines" => Ok(ObjectKind::Lines),
            "text" => Ok(ObjectKind::Text),
            other => Err(SimlinkError::UnknownKind(other.to_string())),
        }
    }
}

/// An ordered list of (field name, value) pairs ready for segment creation
pub(crate) type FieldSet = Vec<(&'static str, FieldValue)>;

/// An ordered list of partial updates for one step
pub(crate) type UpdateSet = Vec<(&'static str, FieldValue)>;

fn styling(field: &'static str, s: &str, capacity: usize) -> Result<FieldValue> {
    if s.len() > capacity {
        return Err(SimlinkError::ShapeMismatch {
            field: field.to_string(),
            expected: capacity,
            got: s.len(),
        });
    }
    Ok(FieldValue::text_padded(s, capacity))
}

fn optional_f64s(values: &[f64]) -> FieldValue {
    if values.is_empty() {
        FieldValue::unset()
    } else {
        FieldValue::f64s(values)
    }
}

/// A surface mesh: vertex positions plus flat count-prefixed connectivity
pub struct Mesh {
    pub positions: Vec<[f64; 3]>,
    /// Flat connectivity `[n1, i0..in1, n2, j0..jn2, ...]`; see [`flatten_cells`]
    pub cells: Vec<i64>,
    pub color: String,
    pub alpha: f64,
    pub wireframe: bool,
    pub line_width: f64,
    pub colormap: String,
    pub colormap_field: Vec<f64>,
    pub colormap_range: Option<[f64; 2]>,
    pub texture_name: String,
    pub texture_coords: Vec<[f64; 2]>,
}

impl Default for Mesh {
    fn default() -> Self {
        Self {
            positions: Vec::new(),
            cells: Vec::new(),
            color: "green".into(),
            alpha: 1.0,
            wireframe: false,
            line_width: 1.0,
            colormap: "jet".into(),
            colormap_field: Vec::new(),
            colormap_range: None,
            texture_name: String::new(),
            texture_coords: Vec::new(),
        }
    }
}

impl Mesh {
    pub(crate) fn into_fields(self) -> Result<FieldSet> {
        Ok(vec![
            ("positions", FieldValue::vec3s(&self.positions)),
            ("cells", FieldValue::i64s(&self.cells)),
            ("color", styling("color", &self.color, STR_CAPACITY)?),
            ("alpha", FieldValue::scalar_f64(self.alpha)),
            ("wireframe", FieldValue::flag(self.wireframe)),
            ("line_width", FieldValue::scalar_f64(self.line_width)),
            ("colormap", styling("colormap", &self.colormap, STR_CAPACITY)?),
            ("colormap_field", optional_f64s(&self.colormap_field)),
            (
                "colormap_range",
                self.colormap_range
                    .map_or_else(FieldValue::unset, |r| FieldValue::f64s(&r)),
            ),
            (
                "texture_name",
                styling("texture_name", &self.texture_name, STR_CAPACITY)?,
            ),
            (
                "texture_coords",
                if self.texture_coords.is_empty() {
                    FieldValue::unset()
                } else {
                    FieldValue::vec2s(&self.texture_coords)
                },
            ),
        ])
    }
}

/// Per-step mesh update; `None` fields keep their bytes and stay clean
#[derive(Default)]
pub struct MeshUpdate {
    pub positions: Option<Vec<[f64; 3]>>,
    pub color: Option<String>,
    pub alpha: Option<f64>,
    pub wireframe: Option<bool>,
    pub line_width: Option<f64>,
    pub colormap_field: Option<Vec<f64>>,
}

impl MeshUpdate {
    pub(crate) fn into_fields(self) -> Result<UpdateSet> {
        let mut set = UpdateSet::new();
        if let Some(v) = self.positions {
            set.push(("positions", FieldValue::vec3s(&v)));
        }
        if let Some(v) = self.color {
            set.push(("color", styling("color", &v, STR_CAPACITY)?));
        }
        if let Some(v) = self.alpha {
            set.push(("alpha", FieldValue::scalar_f64(v)));
        }
        if let Some(v) = self.wireframe {
            set.push(("wireframe", FieldValue::flag(v)));
        }
        if let Some(v) = self.line_width {
            set.push(("line_width", FieldValue::scalar_f64(v)));
        }
        if let Some(v) = self.colormap_field {
            set.push(("colormap_field", FieldValue::f64s(&v)));
        }
        Ok(set)
    }
}

/// A point cloud
pub struct Points {
    pub positions: Vec<[f64; 3]>,
    pub color: String,
    pub alpha: f64,
    pub point_size: f64,
    pub colormap: String,
    pub colormap_field: Vec<f64>,
    pub colormap_range: Option<[f64; 2]>,
}

impl Default for Points {
    fn default() -> Self {
        Self {
            positions: Vec::new(),
            color: "green".into(),
            alpha: 1.0,
            point_size: 4.0,
            colormap: "jet".into(),
            colormap_field: Vec::new(),
            colormap_range: None,
        }
    }
}

impl Points {
    pub(crate) fn into_fields(self) -> Result<FieldSet> {
        Ok(vec![
            ("positions", FieldValue::vec3s(&self.positions)),
            ("color", styling("color", &self.color, STR_CAPACITY)?),
            ("alpha", FieldValue::scalar_f64(self.alpha)),
            ("point_size", FieldValue::scalar_f64(self.point_size)),
            ("colormap", styling("colormap", &self.colormap, STR_CAPACITY)?),
            ("colormap_field", optional_f64s(&self.colormap_field)),
            (
                "colormap_range",
                self.colormap_range
                    .map_or_else(FieldValue::unset, |r| FieldValue::f64s(&r)),
            ),
        ])
    }
}

#[derive(Default)]
pub struct PointsUpdate {
    pub positions: Option<Vec<[f64; 3]>>,
    pub color: Option<String>,
    pub alpha: Option<f64>,
    pub point_size: Option<f64>,
    pub colormap_field: Option<Vec<f64>>,
}

impl PointsUpdate {
    pub(crate) fn into_fields(self) -> Result<UpdateSet> {
        let mut set = UpdateSet::new();
        if let Some(v) = self.positions {
            set.push(("positions", FieldValue::vec3s(&v)));
        }
        if let Some(v) = self.color {
            set.push(("color", styling("color", &v, STR_CAPACITY)?));
        }
        if let Some(v) = self.alpha {
            set.push(("alpha", FieldValue::scalar_f64(v)));
        }
        if let Some(v) = self.point_size {
            set.push(("point_size", FieldValue::scalar_f64(v)));
        }
        if let Some(v) = self.colormap_field {
            set.push(("colormap_field", FieldValue::f64s(&v)));
        }
        Ok(set)
    }
}

/// An arrow field: base positions plus direction vectors
pub struct Arrows {
    pub positions: Vec<[f64; 3]>,
    pub vectors: Vec<[f64; 3]>,
    pub color: String,
    pub alpha: f64,
    pub colormap: String,
    pub colormap_field: Vec<f64>,
    pub colormap_range: Option<[f64; 2]>,
}

impl Default for Arrows {
    fn default() -> Self {
        Self {
            positions: Vec::new(),
            vectors: Vec::new(),
            color: "green".into(),
            alpha: 1.0,
            colormap: "jet".into(),
            colormap_field: Vec::new(),
            colormap_range: None,
        }
    }
}

impl Arrows {
    pub(crate) fn into_fields(self) -> Result<FieldSet> {
        Ok(vec![
            ("positions", FieldValue::vec3s(&self.positions)),
            ("vectors", FieldValue::vec3s(&self.vectors)),
            ("color", styling("color", &self.color, STR_CAPACITY)?),
            ("alpha", FieldValue::scalar_f64(self.alpha)),
            ("colormap", styling("colormap", &self.colormap, STR_CAPACITY)?),
            ("colormap_field", optional_f64s(&self.colormap_field)),
            (
                "colormap_range",
                self.colormap_range
                    .map_or_else(FieldValue::unset, |r| FieldValue::f64s(&r)),
            ),
        ])
    }
}

#[derive(Default)]
pub struct ArrowsUpdate {
    pub positions: Option<Vec<[f64; 3]>>,
    pub vectors: Option<Vec<[f64; 3]>>,
    pub color: Option<String>,
    pub alpha: Option<f64>,
    pub colormap_field: Option<Vec<f64>>,
}

impl ArrowsUpdate {
    pub(crate) fn into_fields(self) -> Result<UpdateSet> {
        let mut set = UpdateSet::new();
        if let Some(v) = self.positions {
            set.push(("positions", FieldValue::vec3s(&v)));
        }
        if let Some(v) = self.vectors {
            set.push(("vectors", FieldValue::vec3s(&v)));
        }
        if let Some(v) = self.color {
            set.push(("color", styling("color", &v, STR_CAPACITY)?));
        }
        if let Some(v) = self.alpha {
            set.push(("alpha", FieldValue::scalar_f64(v)));
        }
        if let Some(v) = self.colormap_field {
            set.push(("colormap_field", FieldValue::f64s(&v)));
        }
        Ok(set)
    }
}

/// Line segments, one per start/end position pair
pub struct Lines {
    pub start_positions: Vec<[f64; 3]>,
    pub end_positions: Vec<[f64; 3]>,
    pub color: String,
    pub alpha: f64,
    pub line_width: f64,
}

impl Default for Lines {
    fn default() -> Self {
        Self {
            start_positions: Vec::new(),
            end_positions: Vec::new(),
            color: "green".into(),
            alpha: 1.0,
            line_width: 1.0,
        }
    }
}

impl Lines {
    pub(crate) fn into_fields(self) -> Result<FieldSet> {
        Ok(vec![
            ("start_positions", FieldValue::vec3s(&self.start_positions)),
            ("end_positions", FieldValue::vec3s(&self.end_positions)),
            ("color", styling("color", &self.color, STR_CAPACITY)?),
            ("alpha", FieldValue::scalar_f64(self.alpha)),
            ("line_width", FieldValue::scalar_f64(self.line_width)),
        ])
    }
}

#[derive(Default)]
pub struct LinesUpdate {
    pub start_positions: Option<Vec<[f64; 3]>>,
    pub end_positions: Option<Vec<[f64; 3]>>,
    pub color: Option<String>,
    pub alpha: Option<f64>,
    pub line_width: Option<f64>,
}

impl LinesUpdate {
    pub(crate) fn into_fields(self) -> Result<UpdateSet> {
        let mut set = UpdateSet::new();
        if let Some(v) = self.start_positions {
            set.push(("start_positions", FieldValue::vec3s(&v)));
        }
        if let Some(v) = self.end_positions {
            set.push(("end_positions", FieldValue::vec3s(&v)));
        }
        if let Some(v) = self.color {
            set.push(("color", styling("color", &v, STR_CAPACITY)?));
        }
        if let Some(v) = self.alpha {
            set.push(("alpha", FieldValue::scalar_f64(v)));
        }
        if let Some(v) = self.line_width {
            set.push(("line_width", FieldValue::scalar_f64(v)));
        }
        Ok(set)
    }
}

/// 2D overlay text
pub struct Text {
    /// Content, up to 100 characters
    pub content: String,
    /// Corner tag: vertical (T/M/B) then horizontal (L/M/R), e.g. "BR"
    pub corner: String,
    pub color: String,
    pub font: String,
    pub size: f64,
    pub bold: bool,
    pub italic: bool,
}

impl Default for Text {
    fn default() -> Self {
        Self {
            content: String::new(),
            corner: "BR".into(),
            color: "black".into(),
            font: String::new(),
            size: 1.0,
            bold: false,
            italic: false,
        }
    }
}

impl Text {
    pub(crate) fn into_fields(self) -> Result<FieldSet> {
        if self.content.is_empty() {
            return Err(SimlinkError::EmptyValue {
                field: "content".to_string(),
            });
        }
        Ok(vec![
            ("content", styling("content", &self.content, TEXT_CAPACITY)?),
            ("corner", styling("corner", &self.corner, STR_CAPACITY)?),
            ("color", styling("color", &self.color, STR_CAPACITY)?),
            ("font", styling("font", &self.font, STR_CAPACITY)?),
            ("size", FieldValue::scalar_f64(self.size)),
            ("bold", FieldValue::flag(self.bold)),
            ("italic", FieldValue::flag(self.italic)),
        ])
    }
}

#[derive(Default)]
pub struct TextUpdate {
    pub content: Option<String>,
    pub color: Option<String>,
    pub bold: Option<bool>,
    pub italic: Option<bool>,
}

impl TextUpdate {
    pub(crate) fn into_fields(self) -> Result<UpdateSet> {
        let mut set = UpdateSet::new();
        if let Some(v) = self.content {
            set.push(("content", styling("content", &v, TEXT_CAPACITY)?));
        }
        if let Some(v) = self.color {
            set.push(("color", styling("color", &v, STR_CAPACITY)?));
        }
        if let Some(v) = self.bold {
            set.push(("bold", FieldValue::flag(v)));
        }
        if let Some(v) = self.italic {
            set.push(("italic", FieldValue::flag(v)));
        }
        Ok(set)
    }
}

/// Flatten ragged cell connectivity to the count-prefixed 1-D layout
/// `[n1, i0..in1, n2, j0..jn2, ...]`
pub fn flatten_cells(cells: &[Vec<i64>]) -> Vec<i64> {
    let mut flat = Vec::with_capacity(cells.iter().map(|c| c.len() + 1).sum());
    for cell in cells {
        flat.push(cell.len() as i64);
        flat.extend_from_slice(cell);
    }
    flat
}

/// Re-group a count-prefixed flat connectivity array into cells
pub fn group_cells(flat: &[i64]) -> Vec<Vec<i64>> {
    let mut cells = Vec::new();
    let mut i = 0;
    while i < flat.len() {
        let n = flat[i] as usize;
        let end = (i + 1 + n).min(flat.len());
        cells.push(flat[i + 1..end].to_vec());
        i = end;
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            ObjectKind::Mesh,
            ObjectKind::Points,
            ObjectKind::Arrows,
            ObjectKind::Lines,
            ObjectKind::Text,
        ] {
            assert_eq!(ObjectKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(ObjectKind::parse("sprite").is_err());
    }

    #[test]
    fn points_schema_order() {
        let fields = Points {
            positions: vec![[0.0; 3]; 4],
            ..Default::default()
        }
        .into_fields()
        .unwrap();
        let names: Vec<_> = fields.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            [
                "positions",
                "color",
                "alpha",
                "point_size",
                "colormap",
                "colormap_field",
                "colormap_range"
            ]
        );
        // Unsupplied optional arrays still get a (placeholder) segment.
        assert!(fields[5].1.is_unset());
    }

    #[test]
    fn oversized_styling_string_is_rejected() {
        let result = Points {
            positions: vec![[0.0; 3]],
            color: "x".repeat(STR_CAPACITY + 1),
            ..Default::default()
        }
        .into_fields();
        assert!(matches!(result, Err(SimlinkError::ShapeMismatch { .. })));
    }

    #[test]
    fn cells_round_trip() {
        let cells = vec![vec![0, 1, 2], vec![2, 3, 4, 5], vec![5, 6]];
        let flat = flatten_cells(&cells);
        assert_eq!(flat, vec![3, 0, 1, 2, 4, 2, 3, 4, 5, 2, 5, 6]);
        assert_eq!(group_cells(&flat), cells);
    }
}
