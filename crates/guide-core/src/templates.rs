//! Built-in workflow template catalog.

use crate::types::{AccessLevel, StepRuntimeOptions, TemplatePhase, TemplateStep, WorkflowTemplate};

pub const SOLID_PHASE_DELIVERY: &str = "solid_phase_delivery";
pub const QUICK_FIX: &str = "quick_fix";

/// Step ids with built-in handlers when execution controls are enabled.
pub const QUALITY_CHECKS_STEP: &str = "quality_checks";
pub const COMMIT_STEP: &str = "commit";

fn step(id: &str, name: &str, prompt: &str) -> TemplateStep {
    TemplateStep {
        id: id.to_string(),
        name: name.to_string(),
        prompt: prompt.to_string(),
        runtime_options: None,
    }
}

fn phase(id: &str, name: &str, steps: Vec<TemplateStep>) -> TemplatePhase {
    TemplatePhase {
        id: id.to_string(),
        name: name.to_string(),
        steps,
    }
}

/// The built-in catalog. `solid_phase_delivery` is always first.
pub fn builtin_templates() -> Vec<WorkflowTemplate> {
    vec![solid_phase_delivery(), quick_fix()]
}

/// Parse a YAML template catalog: a list of templates.
pub fn parse_templates_yaml(content: &str) -> Result<Vec<WorkflowTemplate>, serde_yaml::Error> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(content)
}

/// Find a built-in template by id.
pub fn builtin_template(id: &str) -> Option<WorkflowTemplate> {
    builtin_templates().into_iter().find(|t| t.id == id)
}

fn solid_phase_delivery() -> WorkflowTemplate {
    let mut review = step(
        "review",
        "Self-review",
        "Review the full diff for correctness, naming, and missing tests. Fix anything you find \
         and summarize what changed.",
    );
    review.runtime_options = Some(StepRuntimeOptions {
        access_level: Some(AccessLevel::ReadOnly),
        ..Default::default()
    });

    WorkflowTemplate {
        id: SOLID_PHASE_DELIVERY.to_string(),
        name: "Solid phase delivery".to_string(),
        description: "Understand, plan, implement, verify, review, and commit a change."
            .to_string(),
        default_access_level: AccessLevel::WorkspaceWrite,
        phases: vec![
            phase(
                "discover",
                "Discover",
                vec![
                    step(
                        "understand",
                        "Understand the request",
                        "Read the request and the relevant code. List the files involved and \
                         any open questions before changing anything.",
                    ),
                    step(
                        "plan",
                        "Plan the change",
                        "Write a short, ordered implementation plan with the files to touch \
                         and the tests that will prove the change.",
                    ),
                ],
            ),
            phase(
                "implement",
                "Implement",
                vec![
                    step(
                        "implement",
                        "Implement the plan",
                        "Implement the plan step by step. Keep the change focused and add \
                         tests alongside the code.",
                    ),
                    step(
                        QUALITY_CHECKS_STEP,
                        "Quality checks",
                        "Run the test suite, linter, and type checker. Fix every failure.",
                    ),
                ],
            ),
            phase(
                "deliver",
                "Deliver",
                vec![
                    review,
                    step(
                        COMMIT_STEP,
                        "Commit",
                        "Commit the change with a conventional commit message.",
                    ),
                ],
            ),
        ],
    }
}

fn quick_fix() -> WorkflowTemplate {
    WorkflowTemplate {
        id: QUICK_FIX.to_string(),
        name: "Quick fix".to_string(),
        description: "Fix a small, well-understood issue and commit it.".to_string(),
        default_access_level: AccessLevel::WorkspaceWrite,
        phases: vec![
            phase(
                "fix",
                "Fix",
                vec![
                    step(
                        "fix",
                        "Apply the fix",
                        "Apply the smallest change that fixes the issue and add a regression test.",
                    ),
                    step(
                        QUALITY_CHECKS_STEP,
                        "Quality checks",
                        "Run the test suite and fix any failure.",
                    ),
                ],
            ),
            phase(
                "ship",
                "Ship",
                vec![step(
                    COMMIT_STEP,
                    "Commit",
                    "Commit the fix with a conventional commit message.",
                )],
            ),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn catalog_starts_with_solid_phase_delivery() {
        let templates = builtin_templates();
        assert_eq!(templates[0].id, SOLID_PHASE_DELIVERY);
        assert!(templates[0].phases.len() >= 2);
    }

    #[test]
    fn template_ids_are_unique() {
        let templates = builtin_templates();
        let ids: HashSet<_> = templates.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids.len(), templates.len());
    }

    #[test]
    fn step_ids_are_unique_within_each_template() {
        for template in builtin_templates() {
            let mut seen = HashSet::new();
            for phase in &template.phases {
                assert!(!phase.steps.is_empty(), "{} has an empty phase", template.id);
                for step in &phase.steps {
                    assert!(seen.insert(step.id.clone()), "duplicate step {}", step.id);
                    assert!(!step.prompt.is_empty());
                }
            }
        }
    }

    #[test]
    fn parse_yaml_catalog() {
        let yaml = r#"
- id: docs
  name: Docs pass
  phases:
    - id: write
      name: Write
      steps:
        - id: draft
          name: Draft
          prompt: Draft the docs.
          runtime_options:
            model: small
"#;
        let templates = parse_templates_yaml(yaml).unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].default_access_level, AccessLevel::WorkspaceWrite);
        let step = &templates[0].phases[0].steps[0];
        assert_eq!(
            step.runtime_options.as_ref().and_then(|o| o.model.as_deref()),
            Some("small")
        );
        assert!(parse_templates_yaml("  ").unwrap().is_empty());
    }

    #[test]
    fn lookup_by_id() {
        assert!(builtin_template(QUICK_FIX).is_some());
        assert!(builtin_template("missing").is_none());
    }
}
