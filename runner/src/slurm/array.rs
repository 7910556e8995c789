use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ArrayError {
    #[error("invalid array index '{0}'")]
    InvalidIndex(String),
    #[error("invalid array range '{0}'")]
    InvalidRange(String),
    #[error("array step must be at least 1 in '{0}'")]
    ZeroStep(String),
}

/// expand the scheduler's compact array syntax into its member indices
///
/// Tokens are a bare index, `start-end` or `start-end:step`. Overlapping
/// tokens union into one set. A descending range contributes nothing,
/// matching how sbatch treats it.
pub fn parse_array_arg(arg: &str) -> Result<BTreeSet<u32>, ArrayError> {
    let mut indices = BTreeSet::new();

    for token in arg.split(',') {
        let token = token.trim();
        match token.split_once('-') {
            None => {
                let index = token
                    .parse()
                    .map_err(|_| ArrayError::InvalidIndex(token.to_owned()))?;
                indices.insert(index);
            }
            Some((start, rest)) => {
                let start: u32 = start
                    .parse()
                    .map_err(|_| ArrayError::InvalidRange(token.to_owned()))?;
                let (end, step) = match rest.split_once(':') {
                    None => {
                        let end: u32 = rest
                            .parse()
                            .map_err(|_| ArrayError::InvalidRange(token.to_owned()))?;
                        (end, 1)
                    }
                    Some((end, step)) => {
                        let end: u32 = end
                            .parse()
                            .map_err(|_| ArrayError::InvalidRange(token.to_owned()))?;
                        let step: u32 = step
                            .parse()
                            .map_err(|_| ArrayError::InvalidRange(token.to_owned()))?;
                        (end, step)
                    }
                };
                if step == 0 {
                    return Err(ArrayError::ZeroStep(token.to_owned()));
                }
                indices.extend((start..=end).step_by(step as usize));
            }
        }
    }

    Ok(indices)
}

/// compress indices into the scheduler's range syntax
///
/// Maximal runs of consecutive indices collapse to `start-end`. A run of
/// exactly two stays as two comma items, which reads better for the short
/// arrays that dominate in practice.
pub fn format_array_arg(indices: &BTreeSet<u32>) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut run: Option<(u32, u32)> = None;

    for &index in indices {
        run = match run {
            None => Some((index, index)),
            Some((start, end)) if index == end + 1 => Some((start, index)),
            Some((start, end)) => {
                push_run(&mut parts, start, end);
                Some((index, index))
            }
        };
    }
    if let Some((start, end)) = run {
        push_run(&mut parts, start, end);
    }

    parts.join(",")
}

fn push_run(parts: &mut Vec<String>, start: u32, end: u32) {
    match end - start {
        0 => parts.push(start.to_string()),
        1 => {
            parts.push(start.to_string());
            parts.push(end.to_string());
        }
        _ => parts.push(format!("{start}-{end}")),
    }
}
