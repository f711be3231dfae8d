use crate::encoder::level_order;
use crate::error::{DataIntegrityError, IecvError};
use crate::records::{Outcomes, RecordSet};
use itertools::Itertools;

/// Label used for the all-subjects fold that produces the deployable model.
pub const FULL_DATA_LABEL: &str = "all";

/// One held-out cluster: train on the complement, test on its members.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fold {
    pub cluster: String,
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Distinct cluster labels in natural order.
pub fn clusters(records: &RecordSet) -> Vec<String> {
    records
        .records()
        .iter()
        .map(|r| r.cluster.as_str())
        .unique()
        .sorted_by(|a, b| level_order(a, b))
        .map(str::to_string)
        .collect()
}

/// Leave-one-cluster-out folds, one per cluster.
pub fn folds(records: &RecordSet) -> Result<Vec<Fold>, IecvError> {
    let labels = clusters(records);
    if labels.len() < 2 {
        return Err(DataIntegrityError::TooFewClusters(labels.len()).into());
    }
    Ok(labels
        .into_iter()
        .map(|cluster| {
            let (test, train): (Vec<usize>, Vec<usize>) =
                (0..records.len()).partition(|&i| records.records()[i].cluster == cluster);
            Fold {
                cluster,
                train,
                test,
            }
        })
        .collect())
}

/// Every subject in training, nobody held out.
pub fn full_data_fold(n: usize) -> Fold {
    Fold {
        cluster: FULL_DATA_LABEL.to_string(),
        train: (0..n).collect(),
        test: Vec::new(),
    }
}

/// A training set needs at least one event and one censored subject.
pub fn check_training_outcomes(fold: &Fold, outcomes: &Outcomes) -> Result<(), IecvError> {
    let train = outcomes.select(&fold.train);
    let events = train.n_events();
    let censored = train.n_censored();
    if events == 0 || censored == 0 {
        return Err(DataIntegrityError::DegenerateFold {
            cluster: fold.cluster.clone(),
            rows: fold.train.len(),
            events,
            censored,
        }
        .into());
    }
    Ok(())
}

/// Seed for a fold, derived from the run seed and the cluster label only.
pub fn fold_seed(base_seed: u64, cluster: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let label_hash = cluster
        .bytes()
        .fold(FNV_OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME));

    // SplitMix64 finalizer.
    let mut z = base_seed ^ label_hash.rotate_left(17);
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
