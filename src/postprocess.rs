use crate::config::Config;
use anyhow::{Context, Result};
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Cleans assembled translation output according to `[postprocess]`.
pub fn clean_output(cfg: &Config, text: &str) -> Result<String> {
    let pp = &cfg.postprocess;
    if !pp.enabled {
        return Ok(text.to_string());
    }

    let mut out = text.to_string();

    if pp.normalize_newlines {
        out = out.replace("\r\n", "\n").replace('\r', "\n");
    }

    if pp.normalize_unicode {
        out = out.nfc().collect::<String>();
    }

    if pp.strip_control_chars {
        out = strip_control_chars(&out);
    }

    if pp.remove_by_regex {
        out = remove_by_regex(&pp.regex.patterns, &out)?;
    }

    if pp.trim_trailing_whitespace {
        out = trim_trailing_whitespace(&out);
    }

    Ok(out)
}

fn strip_control_chars(s: &str) -> String {
    s.chars()
        // Line structure and tabs survive.
        .filter(|&ch| matches!(ch, '\n' | '\r' | '\t') || !ch.is_control())
        .collect()
}

fn remove_by_regex(patterns: &[String], s: &str) -> Result<String> {
    let regs: Vec<Regex> = patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("invalid postprocess regex: {p}")))
        .collect::<Result<Vec<_>>>()?;
    if regs.is_empty() {
        return Ok(s.to_string());
    }

    let kept: Vec<&str> = s
        .split_inclusive('\n')
        .filter(|line| {
            let l = line.trim();
            l.is_empty() || !regs.iter().any(|r| r.is_match(l))
        })
        .collect();
    Ok(kept.concat())
}

fn trim_trailing_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for line in s.split_inclusive('\n') {
        match line.strip_suffix('\n') {
            Some(body) => {
                out.push_str(body.trim_end());
                out.push('\n');
            }
            None => out.push_str(line.trim_end()),
        }
    }
    out
}
