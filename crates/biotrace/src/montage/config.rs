//! Montage recipes.
//!
//! A montage names its derived channels in terms of source channel id-names; nothing here is
//! resolved against a concrete recording yet.  Resolution (and everything fallible) happens in
//! [crate::montage::MontageProcessor::map_channels].

use biotrace_dsp::BandReject;

/// How a template names the signals on one side of a derivation.
#[derive(Clone, Debug, PartialEq)]
pub enum TemplateRef {
    /// Nothing; an unreferenced channel when used as a reference.
    None,
    /// One source channel by id-name.
    Single(String),
    /// A weighted set of source channels; weights default to 1.0 at the construction sites.
    Weighted(Vec<(String, f32)>),
    /// The common average of visible source channels.
    CommonAverage,
}

impl TemplateRef {
    pub fn single(name: impl Into<String>) -> TemplateRef {
        TemplateRef::Single(name.into())
    }
}

/// Recording-wide filter defaults.  `None` means the filter is off.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterSettings {
    pub highpass: Option<f64>,
    pub lowpass: Option<f64>,
    pub notch: Option<f64>,
    /// Applied after the fixed three, in this order.
    pub band_rejects: Vec<BandReject>,
}

/// Per-channel filter overrides.
///
/// `None` inherits the recording default, `Some(0.0)` disables the filter for this channel, and
/// any positive value overrides the frequency.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct FilterOverrides {
    pub highpass: Option<f64>,
    pub lowpass: Option<f64>,
    pub notch: Option<f64>,
}

/// Which of the fixed filters a channel-level mutation targets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FilterKind {
    Highpass,
    Lowpass,
    Notch,
}

/// One derived channel recipe.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelTemplate {
    pub label: String,
    pub active: TemplateRef,
    pub reference: TemplateRef,
    /// The derived signal is displayed as already averaged.
    pub averaged: bool,
    pub overrides: FilterOverrides,
}

impl ChannelTemplate {
    /// The common `active − reference` shape.
    pub fn referential(
        label: impl Into<String>,
        active: impl Into<String>,
        reference: impl Into<String>,
    ) -> ChannelTemplate {
        ChannelTemplate {
            label: label.into(),
            active: TemplateRef::single(active),
            reference: TemplateRef::single(reference),
            averaged: false,
            overrides: FilterOverrides::default(),
        }
    }

    pub fn unreferenced(label: impl Into<String>, active: impl Into<String>) -> ChannelTemplate {
        ChannelTemplate {
            label: label.into(),
            active: TemplateRef::single(active),
            reference: TemplateRef::None,
            averaged: false,
            overrides: FilterOverrides::default(),
        }
    }
}

/// A complete montage recipe.
#[derive(Clone, Debug, PartialEq)]
pub struct MontageConfig {
    /// Machine name, unique within a recording.
    pub name: String,
    /// Human label.
    pub label: String,
    /// Channel group sizes for the vertical layout; empty means one flat group.
    pub groups: Vec<usize>,
    pub filters: FilterSettings,
    /// Opaque UI context tags carried with the montage.
    pub highlight_contexts: Vec<String>,
    pub channels: Vec<ChannelTemplate>,
    /// When a reference is the common average, leave the channel's own active signal out of it.
    pub exclude_active_from_avg: bool,
    /// Downsample derived output whose rate exceeds twice this limit; `None` disables.
    pub downsample_limit: Option<f64>,
}

impl MontageConfig {
    pub fn new(name: impl Into<String>, channels: Vec<ChannelTemplate>) -> MontageConfig {
        let name = name.into();
        MontageConfig {
            label: name.clone(),
            name,
            groups: Vec::new(),
            filters: FilterSettings::default(),
            highlight_contexts: Vec::new(),
            channels,
            exclude_active_from_avg: true,
            downsample_limit: None,
        }
    }
}
