//! SRVGGNetCompact: a plain conv stack ending in a pixel shuffle.
//!
//! `body.0` is the input conv, odd indices hold activations (weights only for
//! PReLU), `body.2..=body.2n` are the inner convs and `body.{2n+2}` feeds the
//! shuffle with `out * s^2` channels.

use std::collections::BTreeMap;

use super::{insert_conv, numbered_segment, param, ArchParams, MAX_DEPTH};
use crate::checkpoint::Checkpoint;

const SHUFFLE_SCALES: [(usize, usize); 3] = [(4, 2), (9, 3), (16, 4)];

pub fn default_params() -> ArchParams {
    [
        ("num_in_ch", 3),
        ("num_out_ch", 3),
        ("num_feat", 64),
        ("num_conv", 32),
        ("upscale", 4),
        ("act_prelu", 1),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

pub fn expected_tensors(params: &ArchParams) -> BTreeMap<String, Vec<usize>> {
    let in_ch = param(params, "num_in_ch", 3);
    let out_ch = param(params, "num_out_ch", 3);
    let feat = param(params, "num_feat", 64);
    let num_conv = param(params, "num_conv", 32);
    let upscale = param(params, "upscale", 4);
    let prelu = param(params, "act_prelu", 1) != 0;

    let mut map = BTreeMap::new();
    insert_conv(&mut map, "body.0", feat, in_ch);
    if prelu {
        map.insert("body.1.weight".to_string(), vec![feat]);
    }
    for i in 0..num_conv {
        insert_conv(&mut map, &format!("body.{}", 2 + 2 * i), feat, feat);
        if prelu {
            map.insert(format!("body.{}.weight", 3 + 2 * i), vec![feat]);
        }
    }
    insert_conv(
        &mut map,
        &format!("body.{}", 2 + 2 * num_conv),
        out_ch.saturating_mul(upscale).saturating_mul(upscale),
        feat,
    );
    map
}

pub fn infer_params(checkpoint: &Checkpoint) -> Option<ArchParams> {
    let first = checkpoint.shape("body.0.weight")?;
    if first.len() != 4 {
        return None;
    }
    let (feat, in_ch) = (first[0], first[1]);

    let last_index = checkpoint
        .names()
        .filter(|name| name.ends_with(".weight"))
        .filter_map(|name| {
            let index = numbered_segment(name, "body.")?;
            (checkpoint.shape(name)?.len() == 4).then_some(index)
        })
        .max()?;
    if last_index < 2 {
        return None;
    }
    let num_conv = (last_index - 2) / 2;
    // A stray high index must not imply thousands of layers the file lacks.
    if num_conv > checkpoint.len() || num_conv as i64 > MAX_DEPTH {
        return None;
    }
    let prelu = checkpoint.contains("body.1.weight");

    let last_out = checkpoint.shape(&format!("body.{last_index}.weight"))?[0];
    let (out_ch, upscale) = [in_ch, 3, 1]
        .into_iter()
        .filter(|&out| out > 0 && last_out % out == 0)
        .find_map(|out| {
            SHUFFLE_SCALES
                .iter()
                .find(|(square, _)| last_out / out == *square)
                .map(|&(_, s)| (out, s))
        })?;

    Some(
        [
            ("num_in_ch", in_ch),
            ("num_out_ch", out_ch),
            ("num_feat", feat),
            ("num_conv", num_conv),
            ("upscale", upscale),
            ("act_prelu", usize::from(prelu)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v as i64))
        .collect(),
    )
}
