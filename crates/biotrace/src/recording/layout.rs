//! Vertical placement of visible channels.
//!
//! The viewer positions each visible trace inside a unit-height viewport: baseline 1.0 is the
//! top edge, 0.0 the bottom.  Channels are stacked top to bottom with one slot of breathing room
//! at each edge, so `n` channels divide the (padded) band into `n + 1` slots.  Group gaps widen
//! the divide between adjacent channel groups by `group_spacing` slots; the same arithmetic
//! covers any group count, growing linearly in the number of gaps.

/// Offsets for one visible channel, as fractions of viewport height.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ChannelOffset {
    pub baseline: f64,
    pub top: f64,
    pub bottom: f64,
}

#[derive(Clone, Debug)]
pub struct LayoutConfig {
    /// Fraction of viewport height reserved above the first and below the last channel.
    pub y_padding: f64,
    /// Extra space between adjacent groups, in channel slots.
    pub group_spacing: f64,
    /// Sizes of consecutive channel groups; must sum to the visible channel count.  Empty means
    /// one flat group.
    pub groups: Vec<usize>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        LayoutConfig {
            y_padding: 0.0,
            group_spacing: 1.0,
            groups: Vec::new(),
        }
    }
}

/// Compute offsets for `visible` channels under `config`.
///
/// With no padding and one group this reduces to `baseline_i = 1 - (i+1)/(n+1)` with channel
/// half-height `1/(2(n+1))`.
pub fn channel_offsets(config: &LayoutConfig, visible: usize) -> Vec<ChannelOffset> {
    if visible == 0 {
        return Vec::new();
    }

    let gap_count = if config.groups.is_empty() {
        0
    } else {
        debug_assert_eq!(
            config.groups.iter().sum::<usize>(),
            visible,
            "group sizes must cover every visible channel"
        );
        config.groups.len().saturating_sub(1)
    };

    let band = 1.0 - 2.0 * config.y_padding;
    // Channels plus edge slots plus widened group gaps, all in slot units.
    let slots = (visible + 1) as f64 + gap_count as f64 * config.group_spacing;
    let slot = band / slots;
    let half = slot / 2.0;

    let group_end_indices: Vec<usize> = config
        .groups
        .iter()
        .scan(0usize, |acc, size| {
            *acc += size;
            Some(*acc)
        })
        .collect();

    let mut out = Vec::with_capacity(visible);
    let mut position = 1.0 - config.y_padding;
    for i in 0..visible {
        position -= slot;
        // A group boundary before this channel widens the gap.
        if i > 0 && group_end_indices.contains(&i) {
            position -= config.group_spacing * slot;
        }
        out.push(ChannelOffset {
            baseline: position,
            top: position + half,
            bottom: position - half,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    use biotrace_dsp::close_floats::close_floats64;

    /// Three visible channels, flat layout: baselines 0.75 / 0.50 / 0.25, half-height 0.125.
    #[test]
    fn three_channels_flat() {
        let got = channel_offsets(&LayoutConfig::default(), 3);
        let expected = [0.75, 0.50, 0.25];
        assert_eq!(got.len(), 3);
        for (offset, baseline) in got.iter().zip(expected) {
            close_floats64(offset.baseline, baseline, 1e-9);
            close_floats64(offset.top, baseline + 0.125, 1e-9);
            close_floats64(offset.bottom, baseline - 0.125, 1e-9);
        }
    }

    #[test]
    fn two_groups_widen_the_middle_gap() {
        let config = LayoutConfig {
            y_padding: 0.0,
            group_spacing: 1.0,
            groups: vec![2, 2],
        };
        let got = channel_offsets(&config, 4);

        // 4 channels + 1 widened gap = 6 slots; inner gap is twice the others.
        let slot = 1.0 / 6.0;
        close_floats64(got[0].baseline, 1.0 - slot, 1e-9);
        close_floats64(got[1].baseline, 1.0 - 2.0 * slot, 1e-9);
        close_floats64(got[2].baseline, 1.0 - 4.0 * slot, 1e-9);
        close_floats64(got[3].baseline, 1.0 - 5.0 * slot, 1e-9);
    }

    #[test]
    fn padding_shrinks_the_band() {
        let config = LayoutConfig {
            y_padding: 0.1,
            ..Default::default()
        };
        let got = channel_offsets(&config, 1);
        close_floats64(got[0].baseline, 0.5, 1e-9);
        close_floats64(got[0].top, 0.5 + 0.2, 1e-9);
    }
}
