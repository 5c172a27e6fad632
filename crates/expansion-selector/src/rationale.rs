//! Candidate rationale: AI for the enrichment slice, templates for the rest

use crate::cost::EnrichmentPlan;
use crate::provider::RationaleProvider;
use crate::scorer::{Rationale, RationaleSource};
use crate::ScoredCandidate;
use futures::{stream, StreamExt};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Deterministic rationale built from the score explanation
pub fn template_rationale(c: &ScoredCandidate) -> String {
    let e = &c.explanation;
    let mut text = format!(
        "{} ({}, {}) scores {:.1}/100 with {:.0}% confidence.",
        c.candidate.id,
        c.candidate.city,
        c.candidate.region,
        c.score,
        c.confidence * 100.0
    );

    match (e.white_space.is_white_space, e.white_space.nearest_store_km) {
        (true, Some(d)) => text.push_str(&format!(
            " White space: nearest store is {:.1} km away, beyond the {:.1} km coverage radius.",
            d, e.white_space.coverage_radius_km
        )),
        (true, None) => text.push_str(" White space: no existing stores in the network."),
        (false, Some(d)) => text.push_str(&format!(" Nearest store is {:.1} km away.", d)),
        (false, None) => {}
    }

    if let Some(top) = e
        .factors
        .iter()
        .max_by(|a, b| a.points.total_cmp(&b.points).then_with(|| b.name.cmp(&a.name)))
    {
        text.push_str(&format!(" Strongest factor: {} ({:.1} pts).", top.name.replace('_', " "), top.points));
    }

    let estimated: Vec<&str> = e.factors.iter().filter(|f| f.estimated).map(|f| f.name.as_str()).collect();
    if !estimated.is_empty() {
        text.push_str(&format!(" Estimated inputs: {}.", estimated.join(", ")));
    }
    if c.fell_back {
        text.push_str(" Land validation was unavailable for this site.");
    }
    text
}

/// Prompt sent to the AI rationale provider
pub fn build_prompt(c: &ScoredCandidate) -> String {
    let factors = c
        .explanation
        .factors
        .iter()
        .map(|f| {
            format!(
                "- {}: value {:.2}, weight {:.3}{}",
                f.name,
                f.value,
                f.effective_weight,
                if f.estimated { " (estimated)" } else { "" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Explain in two or three sentences why site {} at ({:.5}, {:.5}) in {}, {} is a good expansion candidate.\n\
         Score: {:.1}/100, confidence {:.2}, area class {:?}, white space: {}.\n\
         Factors:\n{}",
        c.candidate.id,
        c.candidate.center.lat,
        c.candidate.center.lng,
        c.candidate.city,
        c.candidate.region,
        c.score,
        c.confidence,
        c.explanation.area_class,
        c.explanation.white_space.is_white_space,
        factors
    )
}

/// Attach a rationale to every candidate. Returns the candidates and the
/// number of enrichment-selected candidates that fell back to a template.
pub async fn attach_rationales(
    candidates: Vec<ScoredCandidate>,
    plan: &EnrichmentPlan,
    provider: Option<&dyn RationaleProvider>,
    concurrency: usize,
) -> (Vec<ScoredCandidate>, usize) {
    let mut ai_text: HashMap<usize, String> = HashMap::new();
    let mut fallbacks = 0usize;

    match provider {
        Some(provider) if !plan.enrich.is_empty() => {
            let requests = plan.enrich.iter().map(|&i| (i, build_prompt(&candidates[i])));
            let results = stream::iter(requests.map(|(i, prompt)| async move {
                let result = provider.generate(&prompt).await;
                (i, result)
            }))
            .buffer_unordered(concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

            for (i, result) in results {
                let id = &candidates[i].candidate.id;
                match result.map(|r| r.into_text()) {
                    Ok(Some(text)) => {
                        ai_text.insert(i, text);
                    }
                    Ok(None) => {
                        fallbacks += 1;
                        debug!(candidate = %id, "AI rationale refused or empty; using template");
                    }
                    Err(e) => {
                        fallbacks += 1;
                        warn!(candidate = %id, error = %e, "AI rationale failed; using template");
                    }
                }
            }
        }
        Some(_) => {}
        None => {
            fallbacks = plan.enrich.len();
            if fallbacks > 0 {
                debug!("No rationale provider configured; {} candidates get templates", fallbacks);
            }
        }
    }

    let out = candidates
        .into_iter()
        .enumerate()
        .map(|(i, mut c)| {
            let rationale = match ai_text.remove(&i) {
                Some(text) => Rationale {
                    source: RationaleSource::Ai,
                    text,
                },
                None => Rationale {
                    source: RationaleSource::Template,
                    text: template_rationale(&c),
                },
            };
            c.rationale = Some(rationale);
            c
        })
        .collect();

    (out, fallbacks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cannibalization::fixtures::make_scored;
    use crate::config::{AiBudget, ExpansionConfig};
    use crate::cost::AiCostLimiter;
    use crate::provider::{ProviderError, RationaleResponse};
    use async_trait::async_trait;

    /// Answers by the candidate id embedded in the prompt
    struct ScriptedProvider;

    #[async_trait]
    impl RationaleProvider for ScriptedProvider {
        async fn generate(&self, prompt: &str) -> Result<RationaleResponse, ProviderError> {
            if prompt.contains("site c009") {
                Ok(RationaleResponse::Structured {
                    summary: "Strong gap".into(),
                    highlights: vec!["no store within 30 km".into()],
                })
            } else if prompt.contains("site c008") {
                Ok(RationaleResponse::Refusal {
                    reason: "policy".into(),
                })
            } else if prompt.contains("site c007") {
                Err(ProviderError::Unavailable("timeout".into()))
            } else {
                Ok(RationaleResponse::Text {
                    text: "Good site.".into(),
                })
            }
        }
    }

    fn setup() -> (Vec<ScoredCandidate>, EnrichmentPlan) {
        let candidates: Vec<_> = (0..10)
            .map(|i| make_scored(&format!("c{i:03}"), 40.0, -75.0, "Springfield", "A", i as f64 * 10.0))
            .collect();
        let config = ExpansionConfig {
            ai: AiBudget {
                percentage: 40.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let plan = AiCostLimiter::new(&config).select_for_enrichment(&candidates);
        (candidates, plan)
    }

    #[tokio::test]
    async fn test_mixed_provider_outcomes() {
        let (candidates, plan) = setup();
        assert_eq!(plan.enrich.len(), 4);

        let provider: &dyn RationaleProvider = &ScriptedProvider;
        let (out, fallbacks) = attach_rationales(candidates, &plan, Some(provider), 2).await;
        assert_eq!(fallbacks, 2);
        assert!(out.iter().all(|c| c.rationale.is_some()));

        let source = |id: &str| out.iter().find(|c| c.candidate.id == id).unwrap().rationale.clone().unwrap();
        assert_eq!(source("c009").source, RationaleSource::Ai);
        assert_eq!(source("c009").text, "Strong gap (no store within 30 km)");
        assert_eq!(source("c008").source, RationaleSource::Template);
        assert_eq!(source("c007").source, RationaleSource::Template);
        assert_eq!(source("c006").text, "Good site.");
        assert_eq!(source("c000").source, RationaleSource::Template);
    }

    #[tokio::test]
    async fn test_absent_provider_uses_templates() {
        let (candidates, plan) = setup();
        let (out, fallbacks) = attach_rationales(candidates, &plan, None, 4).await;
        assert_eq!(fallbacks, 4);
        assert!(out
            .iter()
            .all(|c| c.rationale.as_ref().unwrap().source == RationaleSource::Template));
    }

    #[test]
    fn test_template_mentions_location_and_score() {
        let c = make_scored("hx7:1:2#0", 40.0, -75.0, "Springfield", "IL", 72.5);
        let text = template_rationale(&c);
        assert!(text.starts_with("hx7:1:2#0 (Springfield, IL) scores 72.5/100"));
    }
}
