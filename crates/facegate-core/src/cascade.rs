//! Viola–Jones cascade detector over Haar-like features.
//!
//! Models are the stock OpenCV `haarcascade_*.xml` files (the
//! `opencv-cascade-classifier` layout) or JSON dumps of the same structure: a
//! base window size, a feature table of weighted rectangles, and boosted stages
//! of small decision trees. Scanning slides the window over the image at growing
//! scales with the features scaled along, then clusters the raw hits like
//! `groupRectangles`.

use std::path::Path;
use std::str::FromStr;

use image::GrayImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Rect;

/// Stage-sum tolerance when comparing against the stage threshold.
const STAGE_EPSILON: f32 = 1e-5;
/// Relative tolerance used when clustering raw detections.
const GROUP_EPS: f32 = 0.2;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    ModelNotFound(String),
    #[error("failed to read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse cascade: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to parse cascade XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("invalid cascade: {0}")]
    Invalid(String),
}

/// Multi-scale scan parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanParams {
    /// Window growth per scale step (> 1).
    pub scale_factor: f32,
    /// A cluster must have more than this many raw hits to be reported.
    pub min_neighbors: u32,
    /// Smallest window (width, height) to evaluate.
    pub min_size: (u32, u32),
}

impl ScanParams {
    pub const fn new(scale_factor: f32, min_neighbors: u32, min_size: u32) -> Self {
        Self { scale_factor, min_neighbors, min_size: (min_size, min_size) }
    }
}

impl Default for ScanParams {
    fn default() -> Self {
        Self::new(1.1, 3, 0)
    }
}

/// Anything that returns candidate regions from a greyscale image.
pub trait RegionDetector: Send + Sync {
    fn detect(&self, gray: &GrayImage, params: &ScanParams) -> Vec<Rect>;

    fn name(&self) -> &str;
}

/// Serialized cascade model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeModel {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<CascadeStage>,
    pub features: Vec<HaarFeature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeStage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// Small decision tree. Child indices > 0 point at `nodes`; ≤ 0 point at `leaves[-idx]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeakClassifier {
    pub nodes: Vec<TreeNode>,
    pub leaves: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub feature: usize,
    pub threshold: f32,
    pub left: i32,
    pub right: i32,
}

/// Weighted rectangles `[x, y, width, height, weight]` in base-window coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaarFeature {
    pub rects: Vec<[f32; 5]>,
    #[serde(default)]
    pub tilted: bool,
}

impl CascadeModel {
    /// Parse an OpenCV `opencv-cascade-classifier` document with HAAR features.
    pub fn from_opencv_xml(text: &str) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(text)?;
        if doc.descendants().any(|n| n.attribute("type_id") == Some("opencv-haar-classifier")) {
            return Err(CascadeError::Invalid("old-style haar classifier layout is not supported".into()));
        }
        let cascade = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| CascadeError::Invalid("no <cascade> element".into()))?;

        for (tag, expected) in [("stageType", "BOOST"), ("featureType", "HAAR")] {
            if let Some(node) = xml_child(cascade, tag) {
                let found = node.text().unwrap_or("").trim();
                if found != expected {
                    return Err(CascadeError::Invalid(format!("{tag} {found:?} is not supported")));
                }
            }
        }

        let mut stages = Vec::new();
        for stage in xml_items(xml_required(cascade, "stages")?) {
            let threshold = xml_scalar(stage, "stageThreshold")?;
            let mut classifiers = Vec::new();
            for weak in xml_items(xml_required(stage, "weakClassifiers")?) {
                let tokens = xml_tokens(xml_required(weak, "internalNodes")?);
                if tokens.is_empty() || tokens.len() % 4 != 0 {
                    return Err(CascadeError::Invalid(format!(
                        "internalNodes has {} values; expected groups of four",
                        tokens.len()
                    )));
                }
                let nodes = tokens
                    .chunks(4)
                    .map(|node| {
                        Ok(TreeNode {
                            left: parse_token(node[0], "internalNodes")?,
                            right: parse_token(node[1], "internalNodes")?,
                            feature: parse_token(node[2], "internalNodes")?,
                            threshold: parse_token(node[3], "internalNodes")?,
                        })
                    })
                    .collect::<Result<Vec<_>, CascadeError>>()?;
                let leaves = xml_numbers(xml_required(weak, "leafValues")?, "leafValues")?;
                classifiers.push(WeakClassifier { nodes, leaves });
            }
            stages.push(CascadeStage { threshold, classifiers });
        }

        let mut features = Vec::new();
        for feature in xml_items(xml_required(cascade, "features")?) {
            let mut rects = Vec::new();
            for rect in xml_items(xml_required(feature, "rects")?) {
                let values: Vec<f32> = xml_numbers(rect, "rects")?;
                let rect: [f32; 5] = values
                    .try_into()
                    .map_err(|v: Vec<f32>| CascadeError::Invalid(format!("rect has {} values; expected 5", v.len())))?;
                rects.push(rect);
            }
            let tilted = match xml_child(feature, "tilted") {
                Some(_) => xml_scalar::<u8>(feature, "tilted")? != 0,
                None => false,
            };
            features.push(HaarFeature { rects, tilted });
        }

        Ok(Self {
            window_width: xml_scalar(cascade, "width")?,
            window_height: xml_scalar(cascade, "height")?,
            stages,
            features,
        })
    }
}

fn xml_child<'a, 'i>(node: roxmltree::Node<'a, 'i>, tag: &str) -> Option<roxmltree::Node<'a, 'i>> {
    node.children().find(|n| n.has_tag_name(tag))
}

fn xml_required<'a, 'i>(node: roxmltree::Node<'a, 'i>, tag: &str) -> Result<roxmltree::Node<'a, 'i>, CascadeError> {
    xml_child(node, tag).ok_or_else(|| CascadeError::Invalid(format!("missing <{tag}>")))
}

/// OpenCV sequence entries are `<_>` elements.
fn xml_items<'a, 'i>(node: roxmltree::Node<'a, 'i>) -> impl Iterator<Item = roxmltree::Node<'a, 'i>> {
    node.children().filter(|n| n.has_tag_name("_"))
}

fn xml_tokens<'a>(node: roxmltree::Node<'a, '_>) -> Vec<&'a str> {
    node.text().unwrap_or("").split_whitespace().collect()
}

fn parse_token<T: FromStr>(token: &str, tag: &str) -> Result<T, CascadeError> {
    token
        .parse()
        .map_err(|_| CascadeError::Invalid(format!("bad value {token:?} in <{tag}>")))
}

fn xml_numbers<T: FromStr>(node: roxmltree::Node<'_, '_>, tag: &str) -> Result<Vec<T>, CascadeError> {
    xml_tokens(node).into_iter().map(|t| parse_token(t, tag)).collect()
}

fn xml_scalar<T: FromStr>(parent: roxmltree::Node<'_, '_>, tag: &str) -> Result<T, CascadeError> {
    match xml_numbers(xml_required(parent, tag)?, tag)?.into_iter().next() {
        Some(value) => Ok(value),
        None => Err(CascadeError::Invalid(format!("<{tag}> is empty"))),
    }
}

/// Feature rectangles at one scan scale.
struct ScaledFeature {
    tilted: bool,
    rects: Vec<(u32, u32, u32, u32, f32)>,
}

/// Loaded, validated cascade.
pub struct HaarCascade {
    name: String,
    model: CascadeModel,
}

impl HaarCascade {
    /// Load a cascade from disk: OpenCV XML for `.xml` files, JSON otherwise.
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        if !path.exists() {
            return Err(CascadeError::ModelNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        let is_xml = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("xml"));
        let model = if is_xml { CascadeModel::from_opencv_xml(&text)? } else { serde_json::from_str(&text)? };
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cascade".to_string());
        let cascade = Self::from_model(name, model)?;

        tracing::info!(
            path = %path.display(),
            stages = cascade.model.stages.len(),
            features = cascade.model.features.len(),
            window = ?(cascade.model.window_width, cascade.model.window_height),
            "loaded cascade"
        );
        Ok(cascade)
    }

    pub fn from_model(name: impl Into<String>, model: CascadeModel) -> Result<Self, CascadeError> {
        validate(&model)?;
        Ok(Self { name: name.into(), model })
    }

    /// Every window that passes all stages, before grouping.
    pub fn scan(&self, gray: &GrayImage, params: &ScanParams) -> Vec<Rect> {
        let (img_w, img_h) = gray.dimensions();
        let base_w = self.model.window_width as f32;
        let base_h = self.model.window_height as f32;
        if img_w == 0 || img_h == 0 || params.scale_factor <= 1.0 {
            return Vec::new();
        }

        let tilted = self.model.features.iter().any(|f| f.tilted);
        let integral = IntegralImages::new(gray, tilted);
        let mut hits = Vec::new();
        let mut scale = 1.0f32;

        loop {
            let win_w = (base_w * scale).round() as u32;
            let win_h = (base_h * scale).round() as u32;
            if win_w > img_w || win_h > img_h {
                break;
            }
            if win_w >= params.min_size.0 && win_h >= params.min_size.1 {
                let step = (if scale <= 2.0 { 2.0 * scale } else { scale }).round().max(1.0) as usize;
                let scaled = self.scaled_features(scale);
                for y in (0..=img_h - win_h).step_by(step) {
                    for x in (0..=img_w - win_w).step_by(step) {
                        if self.window_passes(&integral, &scaled, x, y, win_w, win_h) {
                            hits.push(Rect::new(x, y, win_w, win_h));
                        }
                    }
                }
            }
            scale *= params.scale_factor;
        }
        hits
    }

    fn scaled_features(&self, scale: f32) -> Vec<ScaledFeature> {
        self.model
            .features
            .iter()
            .map(|f| ScaledFeature {
                tilted: f.tilted,
                rects: f
                    .rects
                    .iter()
                    .map(|[x, y, w, h, weight]| {
                        (
                            (x * scale).round() as u32,
                            (y * scale).round() as u32,
                            ((w * scale).round() as u32).max(1),
                            ((h * scale).round() as u32).max(1),
                            *weight,
                        )
                    })
                    .collect(),
            })
            .collect()
    }

    fn window_passes(
        &self,
        integral: &IntegralImages,
        features: &[ScaledFeature],
        x: u32,
        y: u32,
        win_w: u32,
        win_h: u32,
    ) -> bool {
        let area = (win_w * win_h) as f64;
        let mean = integral.sum(x, y, win_w, win_h) as f64 / area;
        let variance = integral.sq_sum(x, y, win_w, win_h) as f64 / area - mean * mean;
        let norm = if variance > 0.0 { variance.sqrt() as f32 } else { 1.0 };

        let feature_value = |idx: usize| -> f32 {
            let feature = &features[idx];
            let total: f64 = feature
                .rects
                .iter()
                .map(|&(rx, ry, rw, rh, weight)| {
                    let sum = if feature.tilted {
                        integral.tilted_sum(x + rx, y + ry, rw, rh)
                    } else {
                        let rw = rw.min(win_w.saturating_sub(rx));
                        let rh = rh.min(win_h.saturating_sub(ry));
                        integral.sum(x + rx, y + ry, rw, rh) as f64
                    };
                    weight as f64 * sum
                })
                .sum();
            (total / area) as f32
        };

        for stage in &self.model.stages {
            let mut stage_sum = 0f32;
            for classifier in &stage.classifiers {
                let mut idx = 0usize;
                let leaf = loop {
                    let node = &classifier.nodes[idx];
                    let next = if feature_value(node.feature) < node.threshold * norm {
                        node.left
                    } else {
                        node.right
                    };
                    if next <= 0 {
                        break classifier.leaves[(-next) as usize];
                    }
                    idx = next as usize;
                };
                stage_sum += leaf;
            }
            if stage_sum < stage.threshold - STAGE_EPSILON {
                return false;
            }
        }
        true
    }
}

impl RegionDetector for HaarCascade {
    fn detect(&self, gray: &GrayImage, params: &ScanParams) -> Vec<Rect> {
        let raw = self.scan(gray, params);
        group_rectangles(&raw, params.min_neighbors)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn validate(model: &CascadeModel) -> Result<(), CascadeError> {
    if model.window_width == 0 || model.window_height == 0 {
        return Err(CascadeError::Invalid("zero-sized detection window".into()));
    }
    if model.stages.is_empty() {
        return Err(CascadeError::Invalid("no stages".into()));
    }
    let (win_w, win_h) = (model.window_width as f32, model.window_height as f32);
    for (i, feature) in model.features.iter().enumerate() {
        for &[x, y, w, h, _] in &feature.rects {
            // Tilted rectangles hang down-left from (x, y) at 45 degrees.
            let outside = if feature.tilted {
                x - h < 0.0 || x + w > win_w || y + w + h > win_h
            } else {
                x + w > win_w || y + h > win_h
            };
            if x < 0.0 || y < 0.0 || w <= 0.0 || h <= 0.0 || outside {
                return Err(CascadeError::Invalid(format!("feature {i} rectangle lies outside the window")));
            }
        }
    }
    for (s, stage) in model.stages.iter().enumerate() {
        for classifier in &stage.classifiers {
            if classifier.nodes.is_empty() {
                return Err(CascadeError::Invalid(format!("stage {s} has an empty classifier")));
            }
            for node in &classifier.nodes {
                if node.feature >= model.features.len() {
                    return Err(CascadeError::Invalid(format!("stage {s} references missing feature {}", node.feature)));
                }
                for child in [node.left, node.right] {
                    let ok = if child <= 0 {
                        ((-child) as usize) < classifier.leaves.len()
                    } else {
                        (child as usize) < classifier.nodes.len()
                    };
                    if !ok {
                        return Err(CascadeError::Invalid(format!("stage {s} has a dangling tree index {child}")));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Sum and squared-sum integral images with a zero top row and left column,
/// plus the 45-degree table when a cascade has tilted features.
struct IntegralImages {
    stride: usize,
    sum: Vec<u64>,
    sq: Vec<u64>,
    tilted: Option<TiltedIntegral>,
}

impl IntegralImages {
    fn new(gray: &GrayImage, with_tilted: bool) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq = vec![0u64; stride * (h + 1)];
        let raw = gray.as_raw();

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let v = raw[y * w + x] as u64;
                row += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row;
                sq[idx] = sq[idx - stride] + row_sq;
            }
        }
        let tilted = with_tilted.then(|| TiltedIntegral::new(gray));
        Self { stride, sum, sq, tilted }
    }

    fn lookup(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0] - table[y1 * stride + x0] - table[y0 * stride + x1]
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::lookup(&self.sum, self.stride, x, y, w, h)
    }

    fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::lookup(&self.sq, self.stride, x, y, w, h)
    }

    fn tilted_sum(&self, x: u32, y: u32, w: u32, h: u32) -> f64 {
        self.tilted.as_ref().map_or(0.0, |t| t.rect_sum(x as i64, y as i64, w as i64, h as i64) as f64)
    }
}

/// Rotated summed-area table: `T(X, Y)` is the sum of pixels `(x, y)` with
/// `y < Y` and `|x - X + 1| <= Y - y - 1`, the upward triangle whose apex sits
/// at `(X - 1, Y - 1)`. Columns are padded by `height + 2` on both sides so
/// every triangle the recurrence touches is stored; beyond the padding the
/// triangles miss the image entirely and read as zero.
struct TiltedIntegral {
    pad: i64,
    cols: i64,
    rows: i64,
    table: Vec<i64>,
}

impl TiltedIntegral {
    fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as i64, gray.height() as i64);
        let pad = h + 2;
        let cols = w + 1 + 2 * pad;
        let rows = h + 1;
        let raw = gray.as_raw();
        let pixel = |x: i64, y: i64| -> i64 {
            if x < 0 || y < 0 || x >= w || y >= h {
                0
            } else {
                raw[(y * w + x) as usize] as i64
            }
        };

        let mut t = Self { pad, cols, rows, table: vec![0; (cols * rows) as usize] };
        for yy in 1..rows {
            for c in 0..cols {
                let xx = c - pad;
                let value = t.at(xx - 1, yy - 1) + t.at(xx + 1, yy - 1) - t.at(xx, yy - 2)
                    + pixel(xx - 1, yy - 1)
                    + pixel(xx - 1, yy - 2);
                t.table[(yy * cols + c) as usize] = value;
            }
        }
        t
    }

    fn at(&self, x: i64, y: i64) -> i64 {
        let c = x + self.pad;
        if y <= 0 || c < 0 || c >= self.cols {
            return 0;
        }
        let y = y.min(self.rows - 1);
        self.table[(y * self.cols + c) as usize]
    }

    /// Sum over the rotated rectangle with top corner `(x, y)`, width `w`
    /// running down-right and height `h` running down-left.
    fn rect_sum(&self, x: i64, y: i64, w: i64, h: i64) -> i64 {
        self.at(x, y) - self.at(x - h, y + h) - self.at(x + w, y + w) + self.at(x + w - h, y + w + h)
    }
}

fn similar(a: &Rect, b: &Rect) -> bool {
    let delta = GROUP_EPS * (a.width.min(b.width) + a.height.min(b.height)) as f32 * 0.5;
    let close = |p: u32, q: u32| (p as f32 - q as f32).abs() <= delta;
    close(a.x, b.x) && close(a.y, b.y) && close(a.right(), b.right()) && close(a.bottom(), b.bottom())
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster overlapping hits, keep clusters with more than `min_neighbors`
/// members, average each, and drop averages nested inside stronger clusters.
/// `min_neighbors == 0` returns the input unchanged.
pub fn group_rectangles(rects: &[Rect], min_neighbors: u32) -> Vec<Rect> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let mut parent: Vec<usize> = (0..rects.len()).collect();
    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j]) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // (sum x, sum y, sum w, sum h, count) per root, in first-seen order.
    let mut roots: Vec<usize> = Vec::new();
    let mut acc: Vec<[u64; 5]> = Vec::new();
    for (i, r) in rects.iter().enumerate() {
        let root = find(&mut parent, i);
        let slot = match roots.iter().position(|&x| x == root) {
            Some(p) => p,
            None => {
                roots.push(root);
                acc.push([0; 5]);
                roots.len() - 1
            }
        };
        let a = &mut acc[slot];
        a[0] += r.x as u64;
        a[1] += r.y as u64;
        a[2] += r.width as u64;
        a[3] += r.height as u64;
        a[4] += 1;
    }

    let clusters: Vec<(Rect, u64)> = acc
        .iter()
        .filter(|a| a[4] > min_neighbors as u64)
        .map(|a| {
            let n = a[4] as f64;
            let avg = |v: u64| (v as f64 / n).round() as u32;
            (Rect::new(avg(a[0]), avg(a[1]), avg(a[2]), avg(a[3])), a[4])
        })
        .collect();

    clusters
        .iter()
        .enumerate()
        .filter(|(i, (r1, n1))| {
            !clusters.iter().enumerate().any(|(j, (r2, n2))| {
                if *i == j {
                    return false;
                }
                let dx = (r2.width as f32 * GROUP_EPS).round() as i64;
                let dy = (r2.height as f32 * GROUP_EPS).round() as i64;
                let inside = r1.x as i64 >= r2.x as i64 - dx
                    && r1.y as i64 >= r2.y as i64 - dy
                    && r1.right() as i64 <= r2.right() as i64 + dx
                    && r1.bottom() as i64 <= r2.bottom() as i64 + dy;
                inside && (*n2 > (*n1).max(3) || *n1 < 3)
            })
        })
        .map(|(_, (r, _))| *r)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One-stage cascade that fires on "dark above, bright below" windows.
    fn edge_model() -> CascadeModel {
        CascadeModel {
            window_width: 20,
            window_height: 20,
            features: vec![HaarFeature {
                rects: vec![[0.0, 0.0, 20.0, 10.0, -1.0], [0.0, 10.0, 20.0, 10.0, 1.0]],
                tilted: false,
            }],
            stages: vec![CascadeStage {
                threshold: 0.5,
                classifiers: vec![WeakClassifier {
                    nodes: vec![TreeNode { feature: 0, threshold: 0.5, left: 0, right: -1 }],
                    leaves: vec![-1.0, 1.0],
                }],
            }],
        }
    }

    fn patch_image() -> GrayImage {
        let mut img = GrayImage::from_pixel(100, 100, image::Luma([120]));
        for y in 30..70 {
            for x in 30..70 {
                let v = if y < 50 { 20 } else { 220 };
                img.put_pixel(x, y, image::Luma([v]));
            }
        }
        img
    }

    #[test]
    fn test_blank_image_has_no_hits() {
        let cascade = HaarCascade::from_model("edge", edge_model()).unwrap();
        let img = GrayImage::from_pixel(80, 80, image::Luma([100]));
        assert!(cascade.scan(&img, &ScanParams::new(1.1, 0, 0)).is_empty());
    }

    #[test]
    fn test_detections_overlap_pattern() {
        let cascade = HaarCascade::from_model("edge", edge_model()).unwrap();
        let img = patch_image();
        let raw = cascade.scan(&img, &ScanParams::new(1.1, 0, 0));
        assert!(!raw.is_empty());

        let grouped = cascade.detect(&img, &ScanParams::new(1.1, 1, 0));
        assert!(!grouped.is_empty());
        assert!(grouped.len() <= raw.len());
        for r in raw.iter().chain(grouped.iter()) {
            assert!(r.x < 70 && r.right() > 30 && r.y < 70 && r.bottom() > 30, "{r:?} misses the patch");
        }
    }

    #[test]
    fn test_min_size_filters_small_windows() {
        let cascade = HaarCascade::from_model("edge", edge_model()).unwrap();
        let raw = cascade.scan(&patch_image(), &ScanParams::new(1.1, 0, 40));
        assert!(raw.iter().all(|r| r.width >= 40 && r.height >= 40));
    }

    #[test]
    fn test_rejects_tilted_rect_outside_window() {
        let mut model = edge_model();
        model.features[0].tilted = true;
        assert!(matches!(HaarCascade::from_model("t", model), Err(CascadeError::Invalid(_))));

        let mut model = edge_model();
        model.features[0] = HaarFeature { rects: vec![[8.0, 0.0, 6.0, 6.0, 1.0]], tilted: true };
        assert!(HaarCascade::from_model("t", model).is_ok());
    }

    #[test]
    fn test_rejects_dangling_tree_index() {
        let mut model = edge_model();
        model.stages[0].classifiers[0].nodes[0].right = -5;
        assert!(matches!(HaarCascade::from_model("t", model), Err(CascadeError::Invalid(_))));
    }

    #[test]
    fn test_model_json_roundtrip_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.json");
        std::fs::write(&path, serde_json::to_string(&edge_model()).unwrap()).unwrap();
        let cascade = HaarCascade::load(&path).unwrap();
        assert_eq!(cascade.name(), "edge");
        assert!(matches!(
            HaarCascade::load(&dir.path().join("missing.json")),
            Err(CascadeError::ModelNotFound(_))
        ));
    }

    /// The edge model in OpenCV's cascade XML layout.
    const EDGE_XML: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>20</height>
  <width>20</width>
  <stageParams>
    <maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams>
    <maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <!-- stage 0 -->
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>5.0000000000000000e-01</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 5.0000000000000000e-01</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 20 10 -1.</_>
        <_>
          0 10 20 10 1.</_></rects></_>
    <_>
      <rects>
        <_>
          8 0 6 6 -1.</_></rects>
      <tilted>1</tilted></_></features></cascade>
</opencv_storage>
"#;

    #[test]
    fn test_load_opencv_xml_cascade() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haarcascade_edge.xml");
        std::fs::write(&path, EDGE_XML).unwrap();
        let cascade = HaarCascade::load(&path).unwrap();
        assert_eq!(cascade.name(), "haarcascade_edge");

        let model = &cascade.model;
        assert_eq!((model.window_width, model.window_height), (20, 20));
        assert_eq!(model.stages.len(), 1);
        assert!((model.stages[0].threshold - 0.5).abs() < 1e-6);
        let tree = &model.stages[0].classifiers[0];
        assert_eq!((tree.nodes[0].left, tree.nodes[0].right, tree.nodes[0].feature), (0, -1, 0));
        assert_eq!(tree.leaves, vec![-1.0, 1.0]);
        assert_eq!(model.features[0].rects[1], [0.0, 10.0, 20.0, 10.0, 1.0]);
        assert!(!model.features[0].tilted);
        assert!(model.features[1].tilted);

        // Same detections as the hand-built model; the unused tilted feature changes nothing.
        let params = ScanParams::new(1.1, 0, 0);
        let expected = HaarCascade::from_model("edge", edge_model()).unwrap().scan(&patch_image(), &params);
        assert_eq!(cascade.scan(&patch_image(), &params), expected);
    }

    #[test]
    fn test_xml_rejects_unsupported_layouts() {
        let lbp = EDGE_XML.replace("<featureType>HAAR", "<featureType>LBP");
        assert!(matches!(CascadeModel::from_opencv_xml(&lbp), Err(CascadeError::Invalid(_))));

        let old = r#"<opencv_storage><face type_id="opencv-haar-classifier"><size>20 20</size></face></opencv_storage>"#;
        assert!(matches!(CascadeModel::from_opencv_xml(old), Err(CascadeError::Invalid(_))));

        let short_nodes = EDGE_XML.replace("0 -1 0 5.0000000000000000e-01", "0 -1 0");
        assert!(matches!(CascadeModel::from_opencv_xml(&short_nodes), Err(CascadeError::Invalid(_))));

        assert!(matches!(CascadeModel::from_opencv_xml("<opencv_storage>"), Err(CascadeError::Xml(_))));
    }

    #[test]
    fn test_tilted_integral_matches_brute_force() {
        let img = GrayImage::from_fn(9, 7, |x, y| image::Luma([((x * 31 + y * 17) % 251) as u8]));
        let tilted = TiltedIntegral::new(&img);
        for yy in 0..=7i64 {
            for xx in 0..=9i64 {
                let mut expected = 0i64;
                for y in 0..yy {
                    for x in 0..9i64 {
                        if (x - xx + 1).abs() <= yy - y - 1 {
                            expected += img.get_pixel(x as u32, y as u32)[0] as i64;
                        }
                    }
                }
                assert_eq!(tilted.at(xx, yy), expected, "T({xx}, {yy})");
            }
        }

        // A unit rotated square covers the two pixels left of its top corner.
        let px = |x: u32, y: u32| img.get_pixel(x, y)[0] as i64;
        assert_eq!(tilted.rect_sum(4, 2, 1, 1), px(3, 2) + px(3, 3));
    }

    #[test]
    fn test_group_rectangles_keeps_dense_clusters() {
        let rects = vec![
            Rect::new(10, 10, 50, 50),
            Rect::new(12, 11, 50, 50),
            Rect::new(11, 12, 52, 50),
            Rect::new(200, 200, 40, 40),
        ];
        let grouped = group_rectangles(&rects, 1);
        assert_eq!(grouped, vec![Rect::new(11, 11, 51, 50)]);
        assert_eq!(group_rectangles(&rects, 0).len(), 4);
        assert!(group_rectangles(&rects, 3).is_empty());
    }

    #[test]
    fn test_group_rectangles_drops_nested_weak_cluster() {
        let mut rects = vec![Rect::new(0, 0, 100, 100); 5];
        rects.extend(vec![Rect::new(30, 30, 20, 20); 2]);
        let grouped = group_rectangles(&rects, 1);
        assert_eq!(grouped, vec![Rect::new(0, 0, 100, 100)]);
    }
}
