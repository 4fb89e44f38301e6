//! A single cron field, fully materialised.

use crate::error::CronError;

/// The permitted values of one cron field over an inclusive `[min, max]` domain.
///
/// Values are kept both as a sorted list (for "next permitted value" scans)
/// and as a membership table indexed by `value - min` (for O(1) matching).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronField {
    values: Vec<u32>,
    lookup: Vec<bool>,
    min: u32,
    max: u32,
}

impl CronField {
    /// Parse `text` over `[min, max]`, resolving each token through `token`.
    ///
    /// Grammar per comma-separated part: `BASE` or `BASE/STEP`, where `BASE`
    /// is `*`, `?`, a single value, or an inclusive range `A-B`. A single
    /// value followed by a step runs up to `max` (`5/15` in a minute field is
    /// 5, 20, 35, 50).
    pub fn parse<F>(text: &str, min: u32, max: u32, token: F) -> Result<Self, CronError>
    where
        F: Fn(&str) -> Option<u32>,
    {
        if text.trim().is_empty() {
            return Err(CronError::field(text, "empty field"));
        }

        let mut lookup = vec![false; (max - min + 1) as usize];
        for part in text.split(',') {
            parse_part(part.trim(), min, max, &token, &mut lookup)?;
        }
        Ok(Self::from_lookup(lookup, min, max))
    }

    fn from_lookup(lookup: Vec<bool>, min: u32, max: u32) -> Self {
        let values = lookup
            .iter()
            .enumerate()
            .filter(|(_, present)| **present)
            .map(|(offset, _)| min + offset as u32)
            .collect();
        Self {
            values,
            lookup,
            min,
            max,
        }
    }

    /// Rebuild the field over a new domain by mapping every value through `f`.
    ///
    /// Used for day-of-week, which is parsed in the conventional 0-7 space and
    /// then normalised to 1-7 (Sunday = 1).
    pub(crate) fn remap<F>(self, min: u32, max: u32, f: F) -> Self
    where
        F: Fn(u32) -> u32,
    {
        let mut lookup = vec![false; (max - min + 1) as usize];
        for value in self.values {
            let mapped = f(value);
            if (min..=max).contains(&mapped) {
                lookup[(mapped - min) as usize] = true;
            }
        }
        Self::from_lookup(lookup, min, max)
    }

    /// O(1) membership test.
    pub fn contains(&self, value: u32) -> bool {
        value >= self.min && value <= self.max && self.lookup[(value - self.min) as usize]
    }

    /// Smallest permitted value `>= value`, if any.
    pub fn next_at_or_after(&self, value: u32) -> Option<u32> {
        let idx = self.values.partition_point(|&v| v < value);
        self.values.get(idx).copied()
    }

    /// Smallest permitted value. A parsed field is never empty.
    pub fn first(&self) -> u32 {
        self.values.first().copied().unwrap_or(self.min)
    }

    /// Sorted permitted values.
    pub fn values(&self) -> &[u32] {
        &self.values
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// True when every value of the domain is permitted.
    pub fn is_unrestricted(&self) -> bool {
        self.values.len() == self.lookup.len()
    }
}

fn parse_part<F>(
    part: &str,
    min: u32,
    max: u32,
    token: &F,
    lookup: &mut [bool],
) -> Result<(), CronError>
where
    F: Fn(&str) -> Option<u32>,
{
    if part.is_empty() {
        return Err(CronError::field(part, "empty list element"));
    }

    let (base, step) = match part.split_once('/') {
        Some((base, step_str)) => {
            let step = step_str
                .parse::<u32>()
                .map_err(|_| CronError::field(part, format!("invalid step '{step_str}'")))?;
            if step == 0 {
                return Err(CronError::field(part, "step must be positive"));
            }
            (base, Some(step))
        }
        None => (part, None),
    };

    let resolve = |tok: &str| {
        token(tok).ok_or_else(|| CronError::field(part, format!("unrecognised value '{tok}'")))
    };

    let (start, end) = if base == "*" || base == "?" {
        (min, max)
    } else if let Some((a, b)) = base.split_once('-') {
        let start = resolve(a)?;
        let end = resolve(b)?;
        if start > end {
            return Err(CronError::field(part, format!("range {start}-{end} is reversed")));
        }
        (start, end)
    } else {
        let value = resolve(base)?;
        match step {
            Some(_) => (value, max),
            None => (value, value),
        }
    };

    if start < min || end > max {
        let value = if start < min { start } else { end };
        return Err(CronError::field(
            part,
            format!("value {value} is out of range [{min}, {max}]"),
        ));
    }

    let step = step.unwrap_or(1) as usize;
    for value in (start..=end).step_by(step) {
        lookup[(value - min) as usize] = true;
    }
    Ok(())
}
