//! Channel ordering before curve construction.

use tracing::info;

use crate::channels::ChannelPair;
use crate::error::Result;
use crate::ratio::UnmixingRatio;
use crate::stats::median;

/// A channel pair put into curve-building order
///
/// `pair.xs()` is the primary channel (the brighter one, whose nonlinearity
/// is measured), `pair.ys()` the reference channel read against it.
/// `xs_per_y` is expressed in that same order.
#[derive(Debug, Clone)]
pub struct Canonical {
    pub pair: ChannelPair,
    pub xs_per_y: UnmixingRatio,
    /// True when the caller's X and Y were exchanged
    pub swapped: bool,
}

impl Canonical {
    pub fn primary(&self) -> &[f64] {
        self.pair.xs()
    }

    pub fn reference(&self) -> &[f64] {
        self.pair.ys()
    }
}

/// Order a pair so that X is the channel with the higher median reading
///
/// When the channels are exchanged the ratio is inverted so it keeps meaning
/// "primary per reference". This is the only place the swap decision is made.
pub fn canonicalize(pair: &ChannelPair, xs_per_y: UnmixingRatio) -> Result<Canonical> {
    let median_x = median(pair.xs())?;
    let median_y = median(pair.ys())?;

    if median_y > median_x {
        info!(
            "Switching axes: median of Y ({:.2}) exceeds median of X ({:.2})",
            median_y, median_x
        );
        Ok(Canonical {
            pair: pair.swapped(),
            xs_per_y: xs_per_y.inverse(),
            swapped: true,
        })
    } else {
        Ok(Canonical {
            pair: pair.clone(),
            xs_per_y,
            swapped: false,
        })
    }
}
