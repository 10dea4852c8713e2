//! Core data models for pixrelay

use crate::error::{RelayError, Result};
use crate::signature::SignatureAlgorithm;
use serde::{Deserialize, Serialize};

/// Service name reported by `GET /`
pub const NAME: &str = "pixrelay";

/// Service version reported by `GET /`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User agent used by outbound loaders
pub const USER_AGENT: &str = concat!("pixrelay/", env!("CARGO_PKG_VERSION"));

/// Static descriptor returned for the root path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub app: String,
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        ServiceInfo {
            app: NAME.to_string(),
            version: VERSION.to_string(),
        }
    }
}

/// Metadata describing a processed image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub format: String,
    pub content_type: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub orientation: u8,
}

/// Single filter invocation, e.g. `fill(white)` or `quality(80)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub name: String,
    pub args: String,
}

/// Parsed image request
///
/// Produced once per inbound request from the escaped URL path and never
/// mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Canonical path: everything after the signature segment. This is the
    /// text the signature is computed over.
    pub path: String,
    /// Signature token embedded in the URL (empty for unsafe URLs)
    pub hash: String,
    /// Caller claims exemption from signature verification
    #[serde(rename = "unsafe")]
    pub unsafe_: bool,
    /// Caller wants metadata instead of image bytes
    pub meta: bool,
    /// Resource identifier, also used as cache and load key
    pub image: String,

    pub trim: bool,
    pub crop_left: u32,
    pub crop_top: u32,
    pub crop_right: u32,
    pub crop_bottom: u32,
    pub fit_in: bool,
    pub stretch: bool,
    pub width: u32,
    pub height: u32,
    pub h_flip: bool,
    pub v_flip: bool,
    pub h_align: Option<String>,
    pub v_align: Option<String>,
    pub smart: bool,
    pub filters: Vec<Filter>,
}

impl Params {
    /// Parse an escaped request path
    ///
    /// Layout:
    /// `/<hash|unsafe>/[meta/][trim/][AxB:CxD/][fit-in/][stretch/][-]Wx[-]H/[halign/][valign/][smart/][filters:...]/IMAGE`
    ///
    /// Option segments are recognized in that order; the first segment that is
    /// not a recognized option starts the image identifier, which may itself
    /// contain slashes.
    ///
    /// # Returns
    /// * `Ok(Params)` if the path carries a token and an image
    /// * `Err(RelayError::InvalidParams)` otherwise
    pub fn parse(uri: &str) -> Result<Self> {
        let trimmed = uri.trim_start_matches('/');
        let (token, path) = trimmed
            .split_once('/')
            .ok_or_else(|| RelayError::InvalidParams(format!("missing image in '{}'", uri)))?;
        if token.is_empty() {
            return Err(RelayError::InvalidParams(format!(
                "missing signature segment in '{}'",
                uri
            )));
        }

        let mut params = Params {
            path: path.to_string(),
            ..Default::default()
        };
        if token == "unsafe" {
            params.unsafe_ = true;
        } else {
            params.hash = token.to_string();
        }

        let segments: Vec<&str> = path.split('/').collect();
        let mut i = 0;
        let mut stage = Stage::Meta;

        while i < segments.len() {
            let seg = segments[i];
            let next = match stage.accept(seg, &mut params) {
                Some(next) => next,
                None if seg.starts_with("filters:") => {
                    // Filter arguments may contain slashes, e.g. watermark URLs.
                    let mut joined = seg.to_string();
                    while !parens_balanced(&joined) && i + 1 < segments.len() {
                        i += 1;
                        joined.push('/');
                        joined.push_str(segments[i]);
                    }
                    params.filters = parse_filters(&joined["filters:".len()..]);
                    Stage::Image
                }
                None => break,
            };
            stage = next;
            i += 1;
            if stage == Stage::Image {
                break;
            }
        }

        params.image = segments[i.min(segments.len())..].join("/");
        if params.image.is_empty() {
            return Err(RelayError::InvalidParams(format!(
                "missing image in '{}'",
                uri
            )));
        }
        Ok(params)
    }

    /// Check the embedded token against the canonical path
    pub fn verify(&self, secret: &str, algorithm: SignatureAlgorithm) -> bool {
        algorithm.verify(&self.path, &self.hash, secret)
    }
}

/// Position in the option grammar. Each stage may only be followed by later ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Meta,
    Trim,
    Crop,
    FitIn,
    Stretch,
    Dimensions,
    HAlign,
    VAlign,
    Smart,
    Filters,
    Image,
}

impl Stage {
    /// Try to consume `seg` at or after this stage. Returns the stage that
    /// follows the consumed option.
    fn accept(self, seg: &str, params: &mut Params) -> Option<Stage> {
        if self <= Stage::Meta && seg == "meta" {
            params.meta = true;
            return Some(Stage::Trim);
        }
        if self <= Stage::Trim && (seg == "trim" || seg.starts_with("trim:")) {
            params.trim = true;
            return Some(Stage::Crop);
        }
        if self <= Stage::Crop {
            if let Some((l, t, r, b)) = parse_crop(seg) {
                params.crop_left = l;
                params.crop_top = t;
                params.crop_right = r;
                params.crop_bottom = b;
                return Some(Stage::FitIn);
            }
        }
        if self <= Stage::FitIn && seg == "fit-in" {
            params.fit_in = true;
            return Some(Stage::Stretch);
        }
        if self <= Stage::Stretch && seg == "stretch" {
            params.stretch = true;
            return Some(Stage::Dimensions);
        }
        if self <= Stage::Dimensions {
            if let Some((w, h, hf, vf)) = parse_dimensions(seg) {
                params.width = w;
                params.height = h;
                params.h_flip = hf;
                params.v_flip = vf;
                return Some(Stage::HAlign);
            }
        }
        if self <= Stage::HAlign && matches!(seg, "left" | "right" | "center") {
            params.h_align = Some(seg.to_string());
            return Some(Stage::VAlign);
        }
        if self <= Stage::VAlign && matches!(seg, "top" | "bottom" | "middle") {
            params.v_align = Some(seg.to_string());
            return Some(Stage::Smart);
        }
        if self <= Stage::Smart && seg == "smart" {
            params.smart = true;
            return Some(Stage::Filters);
        }
        None
    }
}

/// `AxB:CxD`
fn parse_crop(seg: &str) -> Option<(u32, u32, u32, u32)> {
    let (tl, br) = seg.split_once(':')?;
    let (l, t) = tl.split_once('x')?;
    let (r, b) = br.split_once('x')?;
    Some((l.parse().ok()?, t.parse().ok()?, r.parse().ok()?, b.parse().ok()?))
}

/// `[-]Wx[-]H` where either side may be empty
fn parse_dimensions(seg: &str) -> Option<(u32, u32, bool, bool)> {
    let (w, h) = seg.split_once('x')?;
    let side = |s: &str| -> Option<(u32, bool)> {
        let (flip, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        if digits.is_empty() {
            return Some((0, flip));
        }
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some((digits.parse().ok()?, flip))
    };
    let (width, h_flip) = side(w)?;
    let (height, v_flip) = side(h)?;
    if w.is_empty() && h.is_empty() {
        return None;
    }
    Some((width, height, h_flip, v_flip))
}

fn parens_balanced(s: &str) -> bool {
    let mut depth = 0i32;
    for c in s.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
    }
    depth <= 0
}

/// Split `name(args):name(args)` at top-level colons
fn parse_filters(s: &str) -> Vec<Filter> {
    let mut filters = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    let bytes = s.as_bytes();
    for (idx, &b) in bytes.iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => depth -= 1,
            b':' if depth == 0 => {
                push_filter(&mut filters, &s[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    push_filter(&mut filters, &s[start..]);
    filters
}

fn push_filter(filters: &mut Vec<Filter>, raw: &str) {
    if raw.is_empty() {
        return;
    }
    match raw.split_once('(') {
        Some((name, rest)) => filters.push(Filter {
            name: name.to_string(),
            args: rest.strip_suffix(')').unwrap_or(rest).to_string(),
        }),
        None => filters.push(Filter {
            name: raw.to_string(),
            args: String::new(),
        }),
    }
}
