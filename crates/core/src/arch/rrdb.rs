//! RRDBNet (ESRGAN): residual-in-residual dense blocks.
//!
//! Scales below 4 are handled by pixel-unshuffling the input, so the first
//! conv sees `in * 4` channels at x2 and `in * 16` at x1.

use std::collections::BTreeMap;

use super::{insert_conv, numbered_segment, param, ArchParams, MAX_DEPTH};
use crate::checkpoint::Checkpoint;

pub const FALLBACK_NUM_BLOCK: usize = 23;
pub const DEFAULT_GROW_CH: usize = 32;

const UNSHUFFLE: [(usize, usize); 3] = [(1, 4), (4, 2), (16, 1)];

pub fn default_params() -> ArchParams {
    [
        ("num_in_ch", 3),
        ("num_out_ch", 3),
        ("num_feat", 64),
        ("num_block", FALLBACK_NUM_BLOCK as i64),
        ("num_grow_ch", DEFAULT_GROW_CH as i64),
        ("scale", 4),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn unshuffle_factor(scale: usize) -> usize {
    UNSHUFFLE
        .iter()
        .find(|(_, s)| *s == scale)
        .map(|(factor, _)| *factor)
        .unwrap_or(1)
}

pub fn expected_tensors(params: &ArchParams) -> BTreeMap<String, Vec<usize>> {
    let in_ch = param(params, "num_in_ch", 3);
    let out_ch = param(params, "num_out_ch", 3);
    let feat = param(params, "num_feat", 64);
    let blocks = param(params, "num_block", FALLBACK_NUM_BLOCK as i64);
    let grow = param(params, "num_grow_ch", DEFAULT_GROW_CH as i64);
    let scale = param(params, "scale", 4);

    let mut map = BTreeMap::new();
    insert_conv(&mut map, "conv_first", feat, in_ch.saturating_mul(unshuffle_factor(scale)));
    for b in 0..blocks {
        for rdb in 1..=3 {
            for c in 1..=4 {
                insert_conv(
                    &mut map,
                    &format!("body.{b}.rdb{rdb}.conv{c}"),
                    grow,
                    feat.saturating_add(grow.saturating_mul(c - 1)),
                );
            }
            let dense_in = feat.saturating_add(grow.saturating_mul(4));
            insert_conv(&mut map, &format!("body.{b}.rdb{rdb}.conv5"), feat, dense_in);
        }
    }
    for name in ["conv_body", "conv_up1", "conv_up2", "conv_hr"] {
        insert_conv(&mut map, name, feat, feat);
    }
    insert_conv(&mut map, "conv_last", out_ch, feat);
    map
}

pub fn infer_params(checkpoint: &Checkpoint) -> Option<ArchParams> {
    let first = checkpoint.shape("conv_first.weight")?;
    if first.len() != 4 {
        return None;
    }
    let (feat, first_in) = (first[0], first[1]);

    let out_ch = checkpoint
        .shape("conv_last.weight")
        .and_then(|s| s.first().copied())
        .unwrap_or(3);

    // Prefer reading the input channel count as a multiple of the output's.
    let (in_ch, scale) = [out_ch, 3, 1]
        .into_iter()
        .filter(|&c| c > 0 && first_in % c == 0)
        .find_map(|c| {
            UNSHUFFLE
                .iter()
                .find(|(factor, _)| first_in / c == *factor)
                .map(|&(_, s)| (c, s))
        })
        .unwrap_or((first_in, 4));

    let num_block = checkpoint
        .names()
        .filter(|name| name.contains(".rdb"))
        .filter_map(|name| numbered_segment(name, "body."))
        .max()
        .map(|i| i + 1)
        .unwrap_or(FALLBACK_NUM_BLOCK);
    // Each dense block holds 30 tensors; one stray index is not a network.
    let indexed = checkpoint.names().any(|name| name.contains(".rdb"));
    if indexed && (num_block > checkpoint.len() || num_block as i64 > MAX_DEPTH) {
        return None;
    }

    let num_grow_ch = checkpoint
        .shape("body.0.rdb1.conv1.weight")
        .and_then(|s| s.first().copied())
        .unwrap_or(DEFAULT_GROW_CH);

    Some(
        [
            ("num_in_ch", in_ch),
            ("num_out_ch", out_ch),
            ("num_feat", feat),
            ("num_block", num_block),
            ("num_grow_ch", num_grow_ch),
            ("scale", scale),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v as i64))
        .collect(),
    )
}
