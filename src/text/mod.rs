//! Transcript post-processing.
//!
//! Applied to raw ASR text in a fixed order: punctuation normalization,
//! domain vocabulary correction, filler-run collapse, short-noise filtering.
//! The chain is idempotent; running it on its own output changes nothing.

use crate::config::TextConfig;
use std::collections::HashSet;

/// ASCII → fullwidth punctuation used in Chinese transcripts.
const PUNCT_MAP: &[(char, char)] = &[
    (',', '，'),
    ('?', '？'),
    ('!', '！'),
    (';', '；'),
    (':', '：'),
];

/// Post-processor for recognized text.
pub struct TextPostprocessor {
    config: TextConfig,
    /// Vocabulary keys ordered longest-first for longest-match substitution.
    vocab_keys: Vec<String>,
    filler: HashSet<char>,
}

impl TextPostprocessor {
    pub fn new(config: &TextConfig) -> Self {
        let mut vocab_keys: Vec<String> = config.vocabulary.keys().cloned().collect();
        vocab_keys.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then(a.cmp(b)));
        let filler = config.filler_chars.chars().collect();
        Self {
            config: config.clone(),
            vocab_keys,
            filler,
        }
    }

    /// Run the full chain. Returns `None` when the text is dropped as noise.
    pub fn process(&self, text: &str) -> Option<String> {
        let text = normalize(text);
        let text = self.substitute(&text);
        let text = self.collapse_repeats(&text);
        if text.is_empty() {
            return None;
        }
        if self.is_noise(&text) {
            return None;
        }
        Some(text)
    }

    /// Longest-match, ASCII-case-insensitive vocabulary substitution.
    fn substitute(&self, text: &str) -> String {
        if self.vocab_keys.is_empty() {
            return text.to_owned();
        }
        let chars: Vec<char> = text.chars().collect();
        let lower: Vec<char> = chars
            .iter()
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let mut out = String::with_capacity(text.len());
        let mut i = 0;
        'outer: while i < chars.len() {
            for key in &self.vocab_keys {
                let key_chars: Vec<char> = key.chars().map(|c| c.to_ascii_lowercase()).collect();
                let end = i + key_chars.len();
                if end <= lower.len() && lower[i..end] == key_chars[..] {
                    // Replaced spans are not rescanned within this pass.
                    out.push_str(&self.config.vocabulary[key]);
                    i = end;
                    continue 'outer;
                }
            }
            out.push(chars[i]);
            i += 1;
        }
        out
    }

    /// Collapse runs of one character at or above the configured limit.
    /// Text consisting solely of such runs is discarded outright.
    fn collapse_repeats(&self, text: &str) -> String {
        let limit = self.config.repeat_limit.max(2);
        let chars: Vec<char> = text.chars().collect();
        let mut runs: Vec<(char, usize)> = Vec::new();
        for &c in &chars {
            match runs.last_mut() {
                Some((last, n)) if *last == c => *n += 1,
                _ => runs.push((c, 1)),
            }
        }
        let remainder_empty = runs.iter().all(|&(_, n)| n >= limit);
        if remainder_empty && !runs.is_empty() {
            return String::new();
        }
        let mut out = String::with_capacity(text.len());
        for &(c, n) in &runs {
            if n >= limit {
                out.push(c);
            } else {
                for _ in 0..n {
                    out.push(c);
                }
            }
        }
        out
    }

    /// Short text made entirely of filler characters is noise.
    fn is_noise(&self, text: &str) -> bool {
        if !self.config.noise_filter {
            return false;
        }
        let count = text.chars().count();
        count < self.config.min_chars && text.chars().all(|c| self.filler.contains(&c))
    }
}

/// Trim, collapse whitespace runs, map ASCII punctuation to fullwidth.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true; // leading whitespace is dropped
    for c in text.trim().chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
            continue;
        }
        last_was_space = false;
        match PUNCT_MAP.iter().find(|(from, _)| *from == c) {
            Some(&(_, to)) => out.push(to),
            None => out.push(c),
        }
    }
    out.trim_end().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn processor(vocab: &[(&str, &str)]) -> TextPostprocessor {
        let config = TextConfig {
            vocabulary: vocab
                .iter()
                .map(|&(k, v)| (k.to_owned(), v.to_owned()))
                .collect::<BTreeMap<_, _>>(),
            ..TextConfig::default()
        };
        TextPostprocessor::new(&config)
    }

    #[test]
    fn trims_and_normalizes_punctuation() {
        let p = processor(&[]);
        assert_eq!(
            p.process("  这个颜色有蓝色吗?  ").as_deref(),
            Some("这个颜色有蓝色吗？")
        );
    }

    #[test]
    fn vocabulary_prefers_longest_match() {
        let p = processor(&[("直波间", "直播间"), ("直波", "直播")]);
        assert_eq!(
            p.process("欢迎来到直波间看直波").as_deref(),
            Some("欢迎来到直播间看直播")
        );
    }

    #[test]
    fn vocabulary_is_ascii_case_insensitive() {
        let p = processor(&[("sku", "SKU")]);
        assert_eq!(p.process("看下Sku三号链接").as_deref(), Some("看下SKU三号链接"));
    }

    #[test]
    fn filler_run_collapses_to_one() {
        let p = processor(&[]);
        assert_eq!(p.process("真的哈哈哈哈很好用").as_deref(), Some("真的哈很好用"));
    }

    #[test]
    fn pure_filler_run_is_dropped() {
        let p = processor(&[]);
        assert_eq!(p.process("哈哈哈哈哈"), None);
    }

    #[test]
    fn short_all_filler_text_is_dropped() {
        let p = processor(&[]);
        assert_eq!(p.process("嗯啊"), None);
        // Length at the limit passes.
        assert_eq!(p.process("嗯啊哦").as_deref(), Some("嗯啊哦"));
        // Short but not all-filler passes.
        assert_eq!(p.process("好的").as_deref(), Some("好的"));
    }

    #[test]
    fn empty_input_is_dropped() {
        let p = processor(&[]);
        assert_eq!(p.process("   "), None);
    }

    #[test]
    fn idempotent_on_representative_inputs() {
        let p = processor(&[("直波", "直播")]);
        for input in [
            "  这个 颜色, 有蓝色吗?",
            "真的哈哈哈哈很好用!",
            "欢迎来到直波间",
            "上链接上链接上链接",
            "333号宝宝扣1",
        ] {
            if let Some(once) = p.process(input) {
                let twice = p.process(&once);
                assert_eq!(twice.as_deref(), Some(once.as_str()), "input: {input}");
            }
        }
    }
}
