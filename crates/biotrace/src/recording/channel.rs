//! Source channel descriptions.

/// Physical placement of an electrode or lead relative to the body midline.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum Laterality {
    Left,
    Right,
    Center,
    #[default]
    Unknown,
}

/// One raw recorded signal as described by the source header.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceChannel {
    /// Display label, e.g. `Fp1`.
    pub label: String,
    /// Unique id-name used by montage templates to refer to this channel.
    pub name: String,
    /// Modality tag, e.g. `eeg`, `ecg`, `emg`, or `meta` for non-signal bookkeeping channels.
    pub modality: String,
    /// Physical unit of the decoded samples, e.g. `uV`.
    pub unit: String,
    pub sampling_rate: f64,
    /// Total samples over the recording's data duration.
    pub sample_count: u64,
    /// Physical units per display unit.
    pub sensitivity: f64,
    /// +1 or −1.
    pub polarity: i8,
    /// Samples are multiplied by `10^scale` when derived.
    pub scale: i8,
    pub laterality: Laterality,
    /// True when the raw signal is already referenced to the channel mean at the source.
    pub averaged: bool,
}

impl SourceChannel {
    /// A plain signal channel with sane defaults; tests and simple decoders start here.
    pub fn new(name: impl Into<String>, modality: impl Into<String>, sampling_rate: f64) -> Self {
        let name = name.into();
        SourceChannel {
            label: name.clone(),
            name,
            modality: modality.into(),
            unit: String::new(),
            sampling_rate,
            sample_count: 0,
            sensitivity: 1.0,
            polarity: 1,
            scale: 0,
            laterality: Laterality::Unknown,
            averaged: false,
        }
    }

    /// Meta channels carry bookkeeping (e.g. embedded annotations) and never appear in the
    /// visual layout.
    pub fn is_meta(&self) -> bool {
        self.modality == "meta"
    }

    /// The factor applied after derivation: polarity times the scale exponent.
    pub fn derivation_factor(&self) -> f64 {
        self.polarity as f64 * 10f64.powi(self.scale as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_channels_are_flagged() {
        assert!(SourceChannel::new("events", "meta", 1.0).is_meta());
        assert!(!SourceChannel::new("Fp1", "eeg", 250.0).is_meta());
    }

    #[test]
    fn derivation_factor_combines_polarity_and_scale() {
        let mut ch = SourceChannel::new("C3", "eeg", 250.0);
        ch.polarity = -1;
        ch.scale = 2;
        assert_eq!(ch.derivation_factor(), -100.0);
    }
}
