//! Display scaling and per-sample timelines for decoded blocks.

/// Register gain and unit for a known field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldScale {
    pub gain: f64,
    pub unit: &'static str,
    pub decimals: usize,
}

/// Scale for a field name; unknown fields pass through unscaled.
pub fn field_scale(name: &str) -> Option<FieldScale> {
    let (gain, unit, decimals) = match name {
        "vac1" | "vpv1" | "vpv2" => (10.0, "V", 1),
        "iac1" | "ipv1" | "ipv2" => (10.0, "A", 1),
        "fac1" => (100.0, "Hz", 2),
        "temp" => (10.0, "C", 1),
        "export_percent" => (1.0, "%", 0),
        "pac" => (1.0, "W", 0),
        _ => return None,
    };
    Some(FieldScale {
        gain,
        unit,
        decimals,
    })
}

/// Engineering value of a raw register sample.
pub fn scaled_value(name: &str, raw: u16) -> f64 {
    match field_scale(name) {
        Some(scale) => raw as f64 / scale.gain,
        None => raw as f64,
    }
}

/// One sample rendered for logs, e.g. `vac1=230.1V fac1=50.01Hz pac=1200W`.
pub fn format_row(order: &[String], raw: &[u16]) -> String {
    order
        .iter()
        .zip(raw)
        .map(|(name, &value)| match field_scale(name) {
            Some(scale) => format!(
                "{name}={:.*}{}",
                scale.decimals,
                value as f64 / scale.gain,
                scale.unit
            ),
            None => format!("{name}={value}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Device-local timestamps spread evenly across `[ts_start, ts_end]`.
///
/// Both bounds come from the device; results saturate at the i64 range.
pub fn device_ms(samples: usize, ts_start: i64, ts_end: i64) -> Vec<i64> {
    if samples <= 1 || ts_start == ts_end {
        return vec![ts_start; samples.max(1)];
    }
    let span = (ts_end as i128 - ts_start as i128) as f64;
    let steps = (samples - 1) as f64;
    (0..samples)
        .map(|i| {
            let offset = (i as f64 * span / steps).round() as i128;
            (ts_start as i128 + offset).clamp(i64::MIN as i128, i64::MAX as i128) as i64
        })
        .collect()
}

fn looks_like_epoch_ms(value: i64) -> bool {
    value >= 1_000_000_000_000
}

/// Wall-clock milliseconds per sample.
///
/// `ts_list` wins when it covers every sample: taken as-is if it already
/// holds epoch milliseconds, otherwise treated as device time. Device time
/// is anchored so that `ts_end` lands on `received_at`.
pub fn epoch_ms(
    samples: usize,
    ts_start: i64,
    ts_end: i64,
    received_at: i64,
    ts_list: Option<&[i64]>,
) -> Vec<i64> {
    let device_times = match ts_list {
        Some(list) if samples > 0 && list.len() >= samples => {
            let list = &list[..samples];
            if list.iter().all(|&v| looks_like_epoch_ms(v)) {
                return list.to_vec();
            }
            list.to_vec()
        }
        _ => device_ms(samples, ts_start, ts_end),
    };

    device_times
        .into_iter()
        .map(|t| {
            if ts_end == ts_start {
                received_at
            } else {
                received_at.saturating_sub(ts_end.saturating_sub(t))
            }
        })
        .collect()
}
