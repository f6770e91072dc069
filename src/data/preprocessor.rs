// ============================================================
// Layer 4: Spectrum Preprocessor
// ============================================================
// Cleans spectra before they are stored and fed to the model.
//
// Why do we need to preprocess spectra?
//   Raw MS/MS scans contain:
//   - noise peaks far outside the useful m/z window
//   - the unfragmented precursor ion, which tells the model
//     nothing about the fragment ladder
//   - hundreds of low-intensity peaks
//   - intensities spanning several orders of magnitude
//
// Steps (applied in this exact order; order is significant):
//   0. Charge filter        1 <= charge <= max_charge
//   1. m/z clip             keep min_mz <= mz <= max_mz
//   2. Precursor removal    drop peaks within tol Da of the
//                           precursor m/z at every charge 1..=z
//   3. Intensity filter     top-N peaks with at least
//                           min_intensity x the base peak
//   4. Root compression     sqrt(intensity)
//   5. Unit norm            divide by the Euclidean norm
//
// Each step is a pure function record -> record or reject.
// A record whose norm is zero is rejected. Running the chain on
// its own output is a no-op (root compression is applied only
// once; IntensityScaling marks whether it already happened).

use crate::domain::spectrum::{IntensityScaling, SpectrumRecord, PROTON_MASS};

#[derive(Debug, Clone, PartialEq)]
pub enum PreprocessingStep {
    ChargeRange { max_charge: u8 },
    MzRange { min_mz: f64, max_mz: f64 },
    RemovePrecursorPeak { tol_da: f64 },
    FilterIntensity { min_intensity: f32, n_peaks: usize },
    RootScale,
    UnitNorm,
}

impl PreprocessingStep {
    pub fn name(&self) -> &'static str {
        match self {
            PreprocessingStep::ChargeRange { .. } => "charge_range",
            PreprocessingStep::MzRange { .. } => "mz_range",
            PreprocessingStep::RemovePrecursorPeak { .. } => "remove_precursor_peak",
            PreprocessingStep::FilterIntensity { .. } => "filter_intensity",
            PreprocessingStep::RootScale => "root_scale",
            PreprocessingStep::UnitNorm => "unit_norm",
        }
    }

    /// Apply the step; `None` rejects the record.
    pub fn apply(&self, mut rec: SpectrumRecord) -> Option<SpectrumRecord> {
        match *self {
            PreprocessingStep::ChargeRange { max_charge } => {
                (1..=max_charge).contains(&rec.precursor_charge).then_some(rec)
            }

            PreprocessingStep::MzRange { min_mz, max_mz } => {
                rec.retain_peaks(|mz, _| mz >= min_mz && mz <= max_mz);
                Some(rec)
            }

            PreprocessingStep::RemovePrecursorPeak { tol_da } => {
                let neutral = rec.precursor_mass();
                let targets: Vec<f64> = (1..=rec.precursor_charge.max(1))
                    .map(|z| neutral / f64::from(z) + PROTON_MASS)
                    .collect();
                rec.retain_peaks(|mz, _| targets.iter().all(|t| (mz - t).abs() > tol_da));
                Some(rec)
            }

            PreprocessingStep::FilterIntensity {
                min_intensity,
                n_peaks,
            } => {
                let Some(base) = rec.intensity.iter().copied().reduce(f32::max) else {
                    return Some(rec);
                };
                let threshold = min_intensity * base;

                // Rank candidate peaks by intensity, ties broken by position.
                let mut ranked: Vec<usize> = (0..rec.n_peaks())
                    .filter(|&i| rec.intensity[i] >= threshold)
                    .collect();
                ranked.sort_by(|&a, &b| {
                    rec.intensity[b]
                        .total_cmp(&rec.intensity[a])
                        .then(a.cmp(&b))
                });
                ranked.truncate(n_peaks);

                let mut keep = vec![false; rec.n_peaks()];
                for i in ranked {
                    keep[i] = true;
                }
                let mut idx = 0;
                rec.retain_peaks(|_, _| {
                    let k = keep[idx];
                    idx += 1;
                    k
                });
                Some(rec)
            }

            PreprocessingStep::RootScale => {
                if rec.scaling == IntensityScaling::Raw {
                    for v in rec.intensity.iter_mut() {
                        *v = v.sqrt();
                    }
                    rec.scaling = IntensityScaling::Root;
                }
                Some(rec)
            }

            PreprocessingStep::UnitNorm => {
                let norm = rec
                    .intensity
                    .iter()
                    .map(|&v| f64::from(v) * f64::from(v))
                    .sum::<f64>()
                    .sqrt();
                if norm == 0.0 || !norm.is_finite() {
                    return None;
                }
                for v in rec.intensity.iter_mut() {
                    *v = (f64::from(*v) / norm) as f32;
                }
                Some(rec)
            }
        }
    }
}

/// Parameters of the standard chain.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessingParams {
    pub max_charge: u8,
    pub min_mz: f64,
    pub max_mz: f64,
    pub remove_precursor_tol: f64,
    pub min_intensity: f32,
    pub n_peaks: usize,
}

impl Default for PreprocessingParams {
    fn default() -> Self {
        Self {
            max_charge: 10,
            min_mz: 50.0,
            max_mz: 2500.0,
            remove_precursor_tol: 2.0,
            min_intensity: 0.01,
            n_peaks: 150,
        }
    }
}

/// An ordered list of steps applied to every ingested record.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessingChain {
    steps: Vec<PreprocessingStep>,
}

impl PreprocessingChain {
    pub fn new(steps: Vec<PreprocessingStep>) -> Self {
        Self { steps }
    }

    /// The fixed six-step chain.
    pub fn standard(p: &PreprocessingParams) -> Self {
        Self::new(vec![
            PreprocessingStep::ChargeRange {
                max_charge: p.max_charge,
            },
            PreprocessingStep::MzRange {
                min_mz: p.min_mz,
                max_mz: p.max_mz,
            },
            PreprocessingStep::RemovePrecursorPeak {
                tol_da: p.remove_precursor_tol,
            },
            PreprocessingStep::FilterIntensity {
                min_intensity: p.min_intensity,
                n_peaks: p.n_peaks,
            },
            PreprocessingStep::RootScale,
            PreprocessingStep::UnitNorm,
        ])
    }

    pub fn steps(&self) -> &[PreprocessingStep] {
        &self.steps
    }

    pub fn apply(&self, rec: SpectrumRecord) -> Option<SpectrumRecord> {
        self.steps.iter().try_fold(rec, |rec, step| {
            let out = step.apply(rec);
            if out.is_none() {
                tracing::trace!("Spectrum rejected by {}", step.name());
            }
            out
        })
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chain() -> PreprocessingChain {
        PreprocessingChain::standard(&PreprocessingParams::default())
    }

    fn rec(peaks: &[(f64, f32)], precursor_mz: f64, charge: u8) -> SpectrumRecord {
        SpectrumRecord::new(
            peaks.iter().map(|p| p.0).collect(),
            peaks.iter().map(|p| p.1).collect(),
            precursor_mz,
            charge,
        )
    }

    #[test]
    fn test_charge_filter_rejects_out_of_range() {
        let step = PreprocessingStep::ChargeRange { max_charge: 3 };
        assert!(step.apply(rec(&[(100.0, 1.0)], 500.0, 4)).is_none());
        assert!(step.apply(rec(&[(100.0, 1.0)], 500.0, 0)).is_none());
        assert!(step.apply(rec(&[(100.0, 1.0)], 500.0, 3)).is_some());
    }

    #[test]
    fn test_mz_range_is_inclusive() {
        let step = PreprocessingStep::MzRange {
            min_mz: 100.0,
            max_mz: 200.0,
        };
        let out = step
            .apply(rec(&[(99.9, 1.0), (100.0, 1.0), (200.0, 1.0), (200.1, 1.0)], 500.0, 2))
            .unwrap();
        assert_eq!(out.mz, vec![100.0, 200.0]);
    }

    #[test]
    fn test_removes_precursor_at_every_charge() {
        // Neutral mass 1000 Da at charge 2: precursor at 501.007, singly charged at 1001.007.
        let precursor = 500.0 + PROTON_MASS;
        let step = PreprocessingStep::RemovePrecursorPeak { tol_da: 2.0 };
        let out = step
            .apply(rec(
                &[(300.0, 1.0), (500.5, 1.0), (1000.0, 1.0), (1010.0, 1.0)],
                precursor,
                2,
            ))
            .unwrap();
        assert_eq!(out.mz, vec![300.0, 1010.0]);
    }

    #[test]
    fn test_filter_intensity_keeps_top_n_in_mz_order() {
        let step = PreprocessingStep::FilterIntensity {
            min_intensity: 0.1,
            n_peaks: 2,
        };
        let out = step
            .apply(rec(&[(100.0, 5.0), (200.0, 100.0), (300.0, 50.0), (400.0, 1.0)], 800.0, 2))
            .unwrap();
        assert_eq!(out.mz, vec![200.0, 300.0]);
    }

    #[test]
    fn test_min_intensity_is_relative_to_base_peak() {
        let step = PreprocessingStep::FilterIntensity {
            min_intensity: 0.1,
            n_peaks: 10,
        };
        let out = step
            .apply(rec(&[(100.0, 5.0), (200.0, 100.0), (300.0, 10.0)], 800.0, 2))
            .unwrap();
        assert_eq!(out.mz, vec![200.0, 300.0]);
    }

    #[test]
    fn test_chain_outputs_unit_norm_root_scaled() {
        let out = chain()
            .apply(rec(&[(150.0, 16.0), (250.0, 9.0)], 900.0, 2))
            .unwrap();
        assert_eq!(out.scaling, IntensityScaling::Root);
        // sqrt -> (4, 3), norm 5.
        assert!((out.intensity[0] - 0.8).abs() < 1e-6);
        assert!((out.intensity[1] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_zero_norm_is_rejected() {
        assert!(chain().apply(rec(&[(150.0, 0.0)], 900.0, 2)).is_none());
        assert!(chain().apply(rec(&[], 900.0, 2)).is_none());
        // Every peak outside the m/z window.
        assert!(chain().apply(rec(&[(10.0, 5.0)], 900.0, 2)).is_none());
    }

    #[test]
    fn test_root_scale_applies_once() {
        let once = PreprocessingStep::RootScale
            .apply(rec(&[(150.0, 16.0)], 900.0, 2))
            .unwrap();
        let twice = PreprocessingStep::RootScale.apply(once.clone()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.intensity, vec![4.0]);
    }

    proptest! {
        #[test]
        fn prop_chain_is_idempotent(
            peaks in prop::collection::vec((40.0f64..2600.0, 0.0f32..1.0e6), 0..80),
            precursor_mz in 200.0f64..1500.0,
            charge in 0u8..12,
        ) {
            let chain = chain();
            let first = chain.apply(rec(&peaks, precursor_mz, charge));
            match first {
                None => {}
                Some(first) => {
                    let second = chain.apply(first.clone());
                    prop_assert!(second.is_some());
                    let second = second.unwrap();
                    prop_assert_eq!(&first.mz, &second.mz);
                    for (a, b) in first.intensity.iter().zip(&second.intensity) {
                        prop_assert!((a - b).abs() < 1e-5);
                    }
                }
            }
        }
    }
}
