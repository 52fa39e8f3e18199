use serde::{Deserialize, Serialize};

/// Summary of one pass over the training split.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based epoch index.
    pub epoch: usize,
    /// Mean of the per-batch losses.
    pub loss: f32,
    /// Fraction of correctly classified examples, in `[0, 1]`.
    pub accuracy: f32,
}

/// Per-configuration loss histories, in the order the configurations were trained.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LossCurves {
    curves: Vec<(String, Vec<EpochMetrics>)>,
}

impl LossCurves {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a history, or replace it in place when `name` is already present.
    pub fn insert(&mut self, name: impl Into<String>, history: Vec<EpochMetrics>) {
        let name = name.into();
        match self.curves.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = history,
            None => self.curves.push((name, history)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[EpochMetrics]> {
        self.curves
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, history)| history.as_slice())
    }

    pub fn len(&self) -> usize {
        self.curves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[EpochMetrics])> {
        self.curves
            .iter()
            .map(|(name, history)| (name.as_str(), history.as_slice()))
    }

    /// Loss values only, in epoch order.
    pub fn losses(&self, name: &str) -> Option<Vec<f32>> {
        self.get(name)
            .map(|history| history.iter().map(|metrics| metrics.loss).collect())
    }

    /// Longest history across all configurations.
    pub fn max_epochs(&self) -> usize {
        self.curves
            .iter()
            .map(|(_, history)| history.len())
            .max()
            .unwrap_or(0)
    }

    /// Smallest and largest loss over every curve, `None` when no epoch was recorded.
    pub fn loss_range(&self) -> Option<(f32, f32)> {
        self.curves
            .iter()
            .flat_map(|(_, history)| history)
            .map(|metrics| metrics.loss)
            .fold(None, |range, loss| match range {
                None => Some((loss, loss)),
                Some((lo, hi)) => Some((lo.min(loss), hi.max(loss))),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(losses: &[f32]) -> Vec<EpochMetrics> {
        losses
            .iter()
            .enumerate()
            .map(|(i, &loss)| EpochMetrics {
                epoch: i + 1,
                loss,
                accuracy: 0.5,
            })
            .collect()
    }

    #[test]
    fn curves_report_range_and_length() {
        let mut curves = LossCurves::new();
        assert_eq!(curves.loss_range(), None);

        curves.insert("a", history(&[2.0, 1.5, 1.0]));
        curves.insert("b", history(&[2.5, 0.8]));

        assert_eq!(curves.len(), 2);
        assert_eq!(curves.max_epochs(), 3);
        assert_eq!(curves.loss_range(), Some((0.8, 2.5)));
        assert_eq!(curves.losses("b"), Some(vec![2.5, 0.8]));
        assert!(curves.get("missing").is_none());
    }

    #[test]
    fn reinserting_a_name_replaces_its_history() {
        let mut curves = LossCurves::new();
        curves.insert("a", history(&[2.0]));
        curves.insert("a", history(&[1.0, 0.5]));

        assert_eq!(curves.len(), 1);
        assert_eq!(curves.losses("a"), Some(vec![1.0, 0.5]));
    }

    #[test]
    fn iteration_follows_insertion_order() {
        let mut curves = LossCurves::new();
        for name in ["ResNet50_LR_Adjusted", "ResNet18", "ResNet50_Dropout"] {
            curves.insert(name, history(&[1.0]));
        }
        curves.insert("ResNet18", history(&[0.5]));

        let names: Vec<&str> = curves.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["ResNet50_LR_Adjusted", "ResNet18", "ResNet50_Dropout"]);
        assert_eq!(curves.losses("ResNet18"), Some(vec![0.5]));
    }
}
