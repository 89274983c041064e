use crate::models::{RiskAssessment, RiskLabel, Severity};

const MAX_SCORE: f64 = 10.0;
const SEVERITY_CAP: f64 = 4.0;

fn port_points(open_ports: usize) -> f64 {
    match open_ports {
        0 => 0.0,
        1..=2 => 1.0,
        3..=4 => 2.0,
        _ => 3.0,
    }
}

fn volume_points(findings: usize) -> f64 {
    match findings {
        0 => 0.0,
        1..=4 => 1.0,
        5..=9 => 2.0,
        _ => 3.0,
    }
}

fn severity_weight(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 2.0,
        Severity::High => 1.5,
        Severity::Medium => 0.5,
        Severity::Low => 0.2,
        Severity::Info => 0.3,
    }
}

pub fn label_for(score: f64) -> RiskLabel {
    if score >= 8.0 {
        RiskLabel::Critical
    } else if score >= 6.0 {
        RiskLabel::High
    } else if score >= 4.0 {
        RiskLabel::Medium
    } else {
        RiskLabel::Low
    }
}

/// Scores exposure from the open-port count, the follow-up tools' finding count and the
/// severities of the derived remediation findings.
pub fn score<I>(open_ports: usize, followup_findings: usize, severities: I) -> RiskAssessment
where
    I: IntoIterator<Item = Severity>,
{
    let severity: f64 = severities.into_iter().map(severity_weight).sum();
    let total = port_points(open_ports) + volume_points(followup_findings) + severity.min(SEVERITY_CAP);
    let score = (total.min(MAX_SCORE) * 10.0).round() / 10.0;
    RiskAssessment {
        score,
        label: label_for(score),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturated_inputs_hit_the_ceiling() {
        let r = score(
            6,
            12,
            [Severity::Critical, Severity::High, Severity::High, Severity::Medium],
        );
        assert_eq!(r.score, 10.0);
        assert_eq!(r.label, RiskLabel::Critical);
    }

    #[test]
    fn empty_scan_is_low() {
        let r = score(0, 0, []);
        assert_eq!(r.score, 0.0);
        assert_eq!(r.label, RiskLabel::Low);
    }

    #[test]
    fn components_step_at_band_edges() {
        assert_eq!(score(2, 0, []).score, 1.0);
        assert_eq!(score(3, 0, []).score, 2.0);
        assert_eq!(score(5, 0, []).score, 3.0);
        assert_eq!(score(0, 4, []).score, 1.0);
        assert_eq!(score(0, 5, []).score, 2.0);
        assert_eq!(score(0, 10, []).score, 3.0);
    }

    #[test]
    fn severity_sum_is_capped_and_rounded() {
        // 0.2 * 3 = 0.6000000000000001 before rounding
        assert_eq!(score(0, 0, [Severity::Low; 3]).score, 0.6);
        assert_eq!(score(0, 0, [Severity::Critical; 5]).score, 4.0);
        assert_eq!(score(0, 0, [Severity::Info]).score, 0.3);
    }

    #[test]
    fn label_thresholds_are_inclusive() {
        assert_eq!(label_for(8.0), RiskLabel::Critical);
        assert_eq!(label_for(7.9), RiskLabel::High);
        assert_eq!(label_for(6.0), RiskLabel::High);
        assert_eq!(label_for(4.0), RiskLabel::Medium);
        assert_eq!(label_for(3.9), RiskLabel::Low);
    }

    #[test]
    fn score_stays_in_range() {
        for ports in [0, 1, 3, 5, 40] {
            for findings in [0, 1, 5, 10, 500] {
                for n in 0..8 {
                    let r = score(ports, findings, std::iter::repeat(Severity::High).take(n));
                    assert!((0.0..=10.0).contains(&r.score));
                    assert_eq!(r.label, label_for(r.score));
                }
            }
        }
    }
}
