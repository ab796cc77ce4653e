//! Hardy-Weinberg equilibrium diagnostics from dosages.
use ndarray::ArrayView1;
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Relative slack when comparing genotype-configuration probabilities
/// against the observed one.
const TIE_TOLERANCE: f64 = 1e-8;

/// Diploid genotype counts, by copies of the counted allele.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenotypeCounts {
    pub hom_ref: usize,
    pub het: usize,
    pub hom_alt: usize,
}

impl GenotypeCounts {
    pub fn total(&self) -> usize {
        self.hom_ref + self.het + self.hom_alt
    }

    fn add_dosage(&mut self, d: f64) {
        match d.round().clamp(0.0, 2.0) as u8 {
            0 => self.hom_ref += 1,
            1 => self.het += 1,
            _ => self.hom_alt += 1,
        }
    }
}

/// Hemizygous (male X) allele counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HemizygousCounts {
    pub without: usize,
    pub with: usize,
}

/// Rounds each non-missing dosage to the nearest genotype.
pub fn genotype_counts<'a>(dosages: impl IntoIterator<Item = &'a f64>) -> GenotypeCounts {
    let mut counts = GenotypeCounts::default();
    for &d in dosages {
        if !d.is_nan() {
            counts.add_dosage(d);
        }
    }
    counts
}

/// Exact HWE test (Wigginton, Cutler & Abecasis 2005).
/// Returns the total probability of heterozygote counts no more likely than the
/// observed one, given the allele counts.
pub fn hwe_exact(counts: GenotypeCounts) -> f64 {
    let n = counts.total();
    let obs_hets = counts.het;
    let obs_homr = counts.hom_ref.min(counts.hom_alt);
    let rare = 2 * obs_homr + obs_hets;
    if n == 0 || rare == 0 {
        return 1.0;
    }

    let mut probs = vec![0.0f64; rare + 1];

    // Start from the most likely heterozygote count and walk outwards
    let mut mid = rare * (2 * n - rare) / (2 * n);
    if (rare % 2) != (mid % 2) {
        mid += 1;
    }
    probs[mid] = 1.0;
    let mut sum = 1.0;

    let (mut hets, mut homr) = (mid, (rare - mid) / 2);
    let mut homc = n - hets - homr;
    while hets >= 2 {
        probs[hets - 2] = probs[hets] * (hets * (hets - 1)) as f64
            / (4.0 * (homr + 1) as f64 * (homc + 1) as f64);
        sum += probs[hets - 2];
        hets -= 2;
        homr += 1;
        homc += 1;
    }

    let (mut hets, mut homr) = (mid, (rare - mid) / 2);
    let mut homc = n - hets - homr;
    while hets + 2 <= rare {
        probs[hets + 2] =
            probs[hets] * 4.0 * homr as f64 * homc as f64 / ((hets + 2) * (hets + 1)) as f64;
        sum += probs[hets + 2];
        hets += 2;
        homr -= 1;
        homc -= 1;
    }

    let cutoff = probs[obs_hets] * (1.0 + TIE_TOLERANCE);
    let p: f64 = probs.iter().filter(|&&pr| pr > 0.0 && pr <= cutoff).sum::<f64>() / sum;
    p.min(1.0)
}

/// X-chromosome HWE chi-square test (Graffelman & Weir 2016) with 2 degrees of
/// freedom: females diploid, males hemizygous, allele frequency pooled over both.
pub fn hwe_x_chromosome(females: GenotypeCounts, males: HemizygousCounts) -> f64 {
    let nf = females.total() as f64;
    let nm = (males.without + males.with) as f64;
    if nm == 0.0 {
        return hwe_exact(females);
    }
    if nf == 0.0 {
        return 1.0;
    }

    let alleles = 2.0 * nf + nm;
    let p = (2.0 * females.hom_alt as f64 + females.het as f64 + males.with as f64) / alleles;
    let q = 1.0 - p;
    if p <= 0.0 || q <= 0.0 {
        return 1.0;
    }

    let observed = [
        females.hom_ref as f64,
        females.het as f64,
        females.hom_alt as f64,
        males.without as f64,
        males.with as f64,
    ];
    let expected = [nf * q * q, 2.0 * nf * p * q, nf * p * p, nm * q, nm * p];
    let statistic: f64 = observed
        .iter()
        .zip(expected.iter())
        .filter(|(_, &e)| e > 0.0)
        .map(|(&o, &e)| (o - e).powi(2) / e)
        .sum();

    ChiSquared::new(2.0).map_or(1.0, |chi2| chi2.sf(statistic).clamp(0.0, 1.0))
}

/// HWE p-value of one marker. `sex` holds -1 (female) / +1 (male) / NaN codes
/// aligned with `dosages`; it is only used for X-linked markers.
pub fn marker_hwe(dosages: ArrayView1<f64>, sex: Option<&[f64]>, x_linked: bool) -> f64 {
    match (x_linked, sex) {
        (true, Some(sex)) => {
            let mut females = GenotypeCounts::default();
            let mut males = HemizygousCounts::default();
            for (&d, &s) in dosages.iter().zip(sex.iter()) {
                if d.is_nan() || s.is_nan() {
                    continue;
                }
                if s < 0.0 {
                    females.add_dosage(d);
                } else if d >= 0.5 {
                    males.with += 1;
                } else {
                    males.without += 1;
                }
            }
            hwe_x_chromosome(females, males)
        }
        (true, None) => {
            log::trace!("X-linked marker without sex codes; using autosomal HWE test");
            hwe_exact(genotype_counts(dosages.iter()))
        }
        (false, _) => hwe_exact(genotype_counts(dosages.iter())),
    }
}

/// Chromosome labels treated as X-linked.
pub fn is_x_chromosome(chrom: &str) -> bool {
    let c = chrom.trim();
    let c = c.strip_prefix("chr").unwrap_or(c);
    c.eq_ignore_ascii_case("x") || c == "23"
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn counts(hom_ref: usize, het: usize, hom_alt: usize) -> GenotypeCounts {
        GenotypeCounts { hom_ref, het, hom_alt }
    }

    #[test]
    fn counts_rounded_dosages() {
        let d = array![0.0, 0.2, 0.9, 1.4, 1.6, 2.0, f64::NAN];
        assert_eq!(genotype_counts(d.iter()), counts(2, 2, 2));
    }

    #[test]
    fn exact_test_on_small_autosomal_marker() {
        let d = array![0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 2.0];
        assert_abs_diff_eq!(marker_hwe(d.view(), None, false), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn exact_test_reference_values() {
        assert_abs_diff_eq!(hwe_exact(counts(10, 0, 10)), 1.3403021576354265e-06, epsilon = 1e-12);
        assert_abs_diff_eq!(hwe_exact(counts(14, 57, 50)), 0.8422797565707926, epsilon = 1e-6);
        assert_abs_diff_eq!(hwe_exact(counts(20, 1, 1)), 0.06976744186046512, epsilon = 1e-6);
        assert_abs_diff_eq!(hwe_exact(counts(5, 10, 5)), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn monomorphic_and_empty_markers_are_in_equilibrium() {
        assert_eq!(hwe_exact(counts(12, 0, 0)), 1.0);
        assert_eq!(hwe_exact(counts(0, 0, 0)), 1.0);
    }

    #[test]
    fn x_test_reference_values() {
        let at_equilibrium = hwe_x_chromosome(counts(25, 50, 25), HemizygousCounts { without: 50, with: 50 });
        assert_abs_diff_eq!(at_equilibrium, 1.0, epsilon = 1e-9);

        let no_female_hets = hwe_x_chromosome(counts(10, 0, 10), HemizygousCounts { without: 10, with: 10 });
        assert_abs_diff_eq!(no_female_hets, 4.5399929762484854e-05, epsilon = 1e-9);

        let sex_differences = hwe_x_chromosome(counts(30, 40, 30), HemizygousCounts { without: 80, with: 20 });
        assert_abs_diff_eq!(sex_differences, 1.6373771305908097e-07, epsilon = 1e-12);
    }

    #[test]
    fn marker_hwe_partitions_by_sex() {
        // females 0,1,1,2 ; males carrying 0/2 hemizygous calls
        let d = array![0.0, 1.0, 1.0, 2.0, 0.0, 2.0, f64::NAN];
        let sex = [-1.0, -1.0, -1.0, -1.0, 1.0, 1.0, 1.0];
        let p = marker_hwe(d.view(), Some(&sex), true);
        let expected = hwe_x_chromosome(counts(1, 2, 1), HemizygousCounts { without: 1, with: 1 });
        assert_eq!(p, expected);
        assert_abs_diff_eq!(p, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn recognises_x_labels() {
        assert!(is_x_chromosome("X"));
        assert!(is_x_chromosome("chrX"));
        assert!(is_x_chromosome("23"));
        assert!(!is_x_chromosome("2"));
        assert!(!is_x_chromosome("XY"));
    }
}
