//! Spectral channel classification by filename suffix

use std::fmt;
use std::path::PathBuf;

use orthobatch_config::ChannelRuleConfig;

/// Channel an image belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Rgb,
    Nir,
    RedEdge,
    Red,
    Green,
    /// Any other label from a configured rule
    Custom(String),
}

impl Channel {
    /// Parse a configured label. Unknown labels become [`Channel::Custom`].
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label {
            "RGB" => Self::Rgb,
            "NIR" => Self::Nir,
            "RE" => Self::RedEdge,
            "R" => Self::Red,
            "G" => Self::Green,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Label used in chunk names
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Rgb => "RGB",
            Self::Nir => "NIR",
            Self::RedEdge => "RE",
            Self::Red => "R",
            Self::Green => "G",
            Self::Custom(label) => label,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Case-sensitive suffix rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRule {
    pub suffix: String,
    pub channel: Channel,
}

/// Files of one folder split by channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Non-empty buckets in rule order, each sorted
    pub buckets: Vec<(Channel, Vec<PathBuf>)>,
    /// Files no rule matched
    pub unmatched: Vec<PathBuf>,
}

impl Classification {
    /// Bucket for `channel`, if it holds any file
    #[must_use]
    pub fn bucket(&self, channel: &Channel) -> Option<&[PathBuf]> {
        self.buckets
            .iter()
            .find(|(c, _)| c == channel)
            .map(|(_, files)| files.as_slice())
    }
}

/// Ordered rules; the first matching suffix wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRules {
    rules: Vec<ChannelRule>,
}

impl ChannelRules {
    #[must_use]
    pub fn from_config(rules: &[ChannelRuleConfig]) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|r| ChannelRule {
                    suffix: r.suffix.clone(),
                    channel: Channel::from_label(&r.channel),
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn rules(&self) -> &[ChannelRule] {
        &self.rules
    }

    /// Channel of a file name
    #[must_use]
    pub fn classify(&self, file_name: &str) -> Option<&Channel> {
        self.rules
            .iter()
            .find(|r| file_name.ends_with(&r.suffix))
            .map(|r| &r.channel)
    }

    /// Partition `files` into channel buckets.
    ///
    /// Every file lands in exactly one bucket or in `unmatched`. Buckets come
    /// out in the order their channel first appears in the rules.
    #[must_use]
    pub fn partition(&self, files: impl IntoIterator<Item = PathBuf>) -> Classification {
        let mut buckets: Vec<(Channel, Vec<PathBuf>)> = Vec::new();
        for rule in &self.rules {
            if !buckets.iter().any(|(c, _)| *c == rule.channel) {
                buckets.push((rule.channel.clone(), Vec::new()));
            }
        }

        let mut unmatched = Vec::new();
        for file in files {
            let channel = file
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|name| self.classify(name));
            match channel.and_then(|c| buckets.iter_mut().find(|(b, _)| b == c)) {
                Some((_, bucket)) => bucket.push(file),
                None => unmatched.push(file),
            }
        }

        buckets.retain(|(_, files)| !files.is_empty());
        for (_, files) in &mut buckets {
            files.sort();
        }
        unmatched.sort();
        Classification { buckets, unmatched }
    }
}

impl Default for ChannelRules {
    fn default() -> Self {
        Self::from_config(&orthobatch_config::default_channel_rules())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| PathBuf::from("/p").join(n)).collect()
    }

    #[test]
    fn test_default_rules_split_multispectral_capture() {
        let rules = ChannelRules::default();
        let result = rules.partition(paths(&[
            "DJI_0001_MS_NIR.TIF",
            "DJI_0001.JPG",
            "DJI_0001_MS_RE.TIF",
            "DJI_0001_MS_R.TIF",
            "DJI_0001_MS_G.TIF",
            "notes.txt",
        ]));

        let channels: Vec<&str> = result.buckets.iter().map(|(c, _)| c.label()).collect();
        assert_eq!(channels, vec!["RGB", "NIR", "RE", "R", "G"]);
        assert_eq!(result.bucket(&Channel::RedEdge).unwrap().len(), 1);
        assert_eq!(result.unmatched, paths(&["notes.txt"]));
    }

    #[test]
    fn test_suffix_match_is_case_sensitive() {
        let rules = ChannelRules::default();
        assert_eq!(rules.classify("a.jpg"), Some(&Channel::Rgb));
        assert_eq!(rules.classify("a.JPG"), Some(&Channel::Rgb));
        assert_eq!(rules.classify("a.Jpg"), None);
        assert_eq!(rules.classify("a_ms_nir.tif"), None);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rules = ChannelRules::from_config(&[
            ChannelRuleConfig::new("_thermal.jpg", "THERMAL"),
            ChannelRuleConfig::new(".jpg", "RGB"),
        ]);
        assert_eq!(
            rules.classify("IMG_1_thermal.jpg"),
            Some(&Channel::Custom("THERMAL".to_string()))
        );
        assert_eq!(rules.classify("IMG_1.jpg"), Some(&Channel::Rgb));
    }

    #[test]
    fn test_empty_buckets_are_dropped_and_files_sorted() {
        let rules = ChannelRules::default();
        let result = rules.partition(paths(&["b.jpg", "a.jpg", "c.JPG"]));
        assert_eq!(result.buckets.len(), 1);
        assert_eq!(result.buckets[0].0, Channel::Rgb);
        assert_eq!(result.buckets[0].1, paths(&["a.jpg", "b.jpg", "c.JPG"]));
    }

    #[test]
    fn test_channel_labels_round_trip() {
        for label in ["RGB", "NIR", "RE", "R", "G", "SWIR"] {
            assert_eq!(Channel::from_label(label).label(), label);
        }
    }

    fn file_name() -> impl Strategy<Value = String> {
        (
            "[A-Za-z0-9_]{1,8}",
            prop_oneof![
                Just(".jpg"),
                Just(".JPG"),
                Just("_MS_NIR.TIF"),
                Just("_MS_RE.TIF"),
                Just("_MS_R.TIF"),
                Just("_MS_G.TIF"),
                Just(".txt"),
                Just(".tif"),
            ],
        )
            .prop_map(|(stem, suffix)| format!("{stem}{suffix}"))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]
        #[test]
        fn test_partition_is_a_partition(names in prop::collection::vec(file_name(), 0..40)) {
            let rules = ChannelRules::default();
            let input: Vec<PathBuf> = names.iter().map(|n| PathBuf::from("/p").join(n)).collect();
            let result = rules.partition(input.clone());

            let mut seen: Vec<PathBuf> = result
                .buckets
                .iter()
                .flat_map(|(_, files)| files.iter().cloned())
                .chain(result.unmatched.iter().cloned())
                .collect();
            seen.sort();
            let mut expected = input;
            expected.sort();
            prop_assert_eq!(seen, expected);

            for (channel, files) in &result.buckets {
                prop_assert!(!files.is_empty());
                for file in files {
                    let name = file.file_name().unwrap().to_str().unwrap();
                    prop_assert_eq!(rules.classify(name), Some(channel));
                }
            }
            for file in &result.unmatched {
                let name = file.file_name().unwrap().to_str().unwrap();
                prop_assert!(rules.classify(name).is_none());
            }
        }
    }
}
