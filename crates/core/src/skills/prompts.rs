//! Built-in skill prompt templates bundled at compile time.
//!
//! The template text is configuration: callers replace or extend it through
//! [`super::SkillRegistry`], never by editing these constants at runtime.

/// General Analysis - default worker, answers strictly from the excerpt
pub const GENERAL_ANALYSIS: &str = include_str!("defaults/general_analysis.md");

/// Analytical Comparison - weighs two or more subjects against each other
pub const ANALYTICAL_COMPARISON: &str = include_str!("defaults/analytical_comparison.md");

/// Summarization - condenses sections without dropping actionable detail
pub const SUMMARIZATION: &str = include_str!("defaults/summarization.md");

/// Extraction - pulls structured facts with supporting quotes
pub const EXTRACTION: &str = include_str!("defaults/extraction.md");

/// Risk Assessment - identifies and ranks risks
pub const RISK_ASSESSMENT: &str = include_str!("defaults/risk_assessment.md");

/// Critique - evaluates claims and arguments
pub const CRITIQUE: &str = include_str!("defaults/critique.md");

/// Built-in skills as (name, description, template, output hint)
pub fn all_defaults() -> Vec<(&'static str, &'static str, &'static str, &'static str)> {
    vec![
        (
            "general_analysis",
            "General-purpose analysis of a document excerpt; used when no specialised skill fits",
            GENERAL_ANALYSIS,
            "Direct answer in prose, citing section names",
        ),
        (
            "analytical_comparison",
            "Compare two or more subjects (options, sections, plans) across relevant dimensions",
            ANALYTICAL_COMPARISON,
            "Per-dimension comparison followed by a short judgement",
        ),
        (
            "summarization",
            "Condense one or more sections while keeping numbers, dates and commitments",
            SUMMARIZATION,
            "Ordered bullet summary",
        ),
        (
            "extraction",
            "Extract specific facts, figures or entities with supporting quotes",
            EXTRACTION,
            "List or table of facts, each with its source phrase",
        ),
        (
            "risk_assessment",
            "Identify, rate and rank risks stated in or implied by the text",
            RISK_ASSESSMENT,
            "Ranked list of risks with likelihood, impact and mitigations",
        ),
        (
            "critique",
            "Evaluate claims, arguments or proposals for support and gaps",
            CRITIQUE,
            "Claim-by-claim assessment with open questions",
        ),
    ]
}
