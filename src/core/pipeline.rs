//! Pipeline definition.
//!
//! The lead pipeline is a fixed sequence of six steps. The four research
//! and writing steps ask the model for structured JSON; final package
//! assembly compiles everything into markdown; completion hands the lead
//! back. Each step's output is stored as an artifact and can be decoded
//! back into [`PipelineContext`] when a run resumes.

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::adapters::GenerationRequest;
use crate::domain::{Artifact, Lead, StepName};

use super::guarded::GuardedRequest;

/// Errors building step inputs or decoding step outputs
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Step '{step}' needs the output of '{needs}', which is not available")]
    MissingContext { step: StepName, needs: StepName },

    #[error("Artifact belongs to step '{found}', expected '{expected}'")]
    StepMismatch { expected: StepName, found: StepName },

    #[error("Artifact for '{step}' is not a JSON object")]
    NotAnObject { step: StepName },

    #[error("Artifact for '{step}' is not valid JSON: {source}")]
    Json {
        step: StepName,
        #[source]
        source: serde_json::Error,
    },

    #[error("Step '{0}' is not a model step")]
    NotAModelStep(StepName),
}

/// Output of one step, tagged by the step that produced it
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    Enrichment(Value),
    Persona(Value),
    Offer(Value),
    Outreach(Value),
    FinalPackage(String),
    Completion(String),
}

impl StepOutput {
    /// Wrap structured model output for a JSON step
    pub fn structured(step: StepName, data: Value) -> Result<Self, PipelineError> {
        match step {
            StepName::Enrichment => Ok(Self::Enrichment(data)),
            StepName::PersonaGeneration => Ok(Self::Persona(data)),
            StepName::OfferGeneration => Ok(Self::Offer(data)),
            StepName::OutreachGeneration => Ok(Self::Outreach(data)),
            other => Err(PipelineError::NotAModelStep(other)),
        }
    }

    pub fn step(&self) -> StepName {
        match self {
            Self::Enrichment(_) => StepName::Enrichment,
            Self::Persona(_) => StepName::PersonaGeneration,
            Self::Offer(_) => StepName::OfferGeneration,
            Self::Outreach(_) => StepName::OutreachGeneration,
            Self::FinalPackage(_) => StepName::FinalPackageAssembly,
            Self::Completion(_) => StepName::Completion,
        }
    }

    /// Decode a stored artifact back into step output
    pub fn decode(step: StepName, artifact: &Artifact) -> Result<Self, PipelineError> {
        if artifact.step_name != step {
            return Err(PipelineError::StepMismatch {
                expected: step,
                found: artifact.step_name,
            });
        }

        let json = || -> Result<Value, PipelineError> {
            let value: Value = serde_json::from_str(&artifact.content)
                .map_err(|source| PipelineError::Json { step, source })?;
            if value.is_object() {
                Ok(value)
            } else {
                Err(PipelineError::NotAnObject { step })
            }
        };

        match step {
            StepName::Enrichment => Ok(Self::Enrichment(json()?)),
            StepName::PersonaGeneration => Ok(Self::Persona(json()?)),
            StepName::OfferGeneration => Ok(Self::Offer(json()?)),
            StepName::OutreachGeneration => Ok(Self::Outreach(json()?)),
            StepName::FinalPackageAssembly => Ok(Self::FinalPackage(artifact.content.clone())),
            StepName::Completion => Ok(Self::Completion(artifact.content.clone())),
        }
    }

    /// Render as an artifact owned by `run_id`
    pub fn to_artifact(&self, run_id: Uuid) -> Artifact {
        let content = match self {
            Self::Enrichment(v) | Self::Persona(v) | Self::Offer(v) | Self::Outreach(v) => {
                serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
            }
            Self::FinalPackage(s) | Self::Completion(s) => s.clone(),
        };
        let step = self.step();
        Artifact::new(run_id, step, step.artifact_type(), content)
    }
}

/// Working context threaded through a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineContext {
    pub enrichment: Option<Value>,
    pub persona: Option<Value>,
    pub offer: Option<Value>,
    pub outreach: Option<Value>,
    pub final_package: Option<String>,
    pub completion: Option<String>,
}

impl PipelineContext {
    /// Record a step's output
    pub fn apply(&mut self, output: StepOutput) {
        match output {
            StepOutput::Enrichment(v) => self.enrichment = Some(v),
            StepOutput::Persona(v) => self.persona = Some(v),
            StepOutput::Offer(v) => self.offer = Some(v),
            StepOutput::Outreach(v) => self.outreach = Some(v),
            StepOutput::FinalPackage(s) => self.final_package = Some(s),
            StepOutput::Completion(s) => self.completion = Some(s),
        }
    }

    fn require<'a>(
        value: &'a Option<Value>,
        step: StepName,
        needs: StepName,
    ) -> Result<&'a Value, PipelineError> {
        value
            .as_ref()
            .ok_or(PipelineError::MissingContext { step, needs })
    }
}

/// Dot paths each model step must return
pub fn required_keys(step: StepName) -> &'static [&'static str] {
    match step {
        StepName::Enrichment => &["company.summary", "company.industry", "pain_points", "opportunities"],
        StepName::PersonaGeneration => &["persona.role", "persona.goals", "persona.objections"],
        StepName::OfferGeneration => &["offer.headline", "offer.value_proposition", "offer.deliverables"],
        StepName::OutreachGeneration => &["email.subject", "email.body", "follow_ups"],
        StepName::FinalPackageAssembly | StepName::Completion => &[],
    }
}

fn schema_hint(step: StepName) -> Option<&'static str> {
    match step {
        StepName::Enrichment => Some(
            r#"{"company": {"summary": string, "industry": string, "size": string}, "pain_points": [string], "opportunities": [string]}"#,
        ),
        StepName::PersonaGeneration => Some(
            r#"{"persona": {"role": string, "goals": [string], "objections": [string], "tone": string}}"#,
        ),
        StepName::OfferGeneration => Some(
            r#"{"offer": {"headline": string, "value_proposition": string, "deliverables": [string], "price_anchor": string}}"#,
        ),
        StepName::OutreachGeneration => Some(
            r#"{"email": {"subject": string, "body": string}, "follow_ups": [{"day": number, "message": string}]}"#,
        ),
        StepName::FinalPackageAssembly | StepName::Completion => None,
    }
}

const ANALYST_INSTRUCTION: &str = "You are a B2B sales research analyst. \
Be specific to the business described and never invent contact details.";

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Build the structured request for a model step
pub fn guarded_request(
    step: StepName,
    lead: &Lead,
    context: &PipelineContext,
    model: &str,
) -> Result<GuardedRequest, PipelineError> {
    let profile = lead.describe();

    let prompt = match step {
        StepName::Enrichment => format!(
            "Research this prospect and summarise the company, its likely pain points, \
             and the opportunities a service provider could address.\n\n{}",
            profile
        ),
        StepName::PersonaGeneration => {
            let enrichment = PipelineContext::require(&context.enrichment, step, StepName::Enrichment)?;
            format!(
                "Describe the most likely decision maker at this business.\n\n{}\n\nResearch:\n{}",
                profile,
                pretty(enrichment)
            )
        }
        StepName::OfferGeneration => {
            let enrichment = PipelineContext::require(&context.enrichment, step, StepName::Enrichment)?;
            let persona = PipelineContext::require(&context.persona, step, StepName::PersonaGeneration)?;
            format!(
                "Design an irresistible, concrete offer for this decision maker.\n\n{}\n\nResearch:\n{}\n\nPersona:\n{}",
                profile,
                pretty(enrichment),
                pretty(persona)
            )
        }
        StepName::OutreachGeneration => {
            let persona = PipelineContext::require(&context.persona, step, StepName::PersonaGeneration)?;
            let offer = PipelineContext::require(&context.offer, step, StepName::OfferGeneration)?;
            format!(
                "Write a short cold email and a follow-up sequence presenting the offer.\n\n{}\n\nPersona:\n{}\n\nOffer:\n{}",
                profile,
                pretty(persona),
                pretty(offer)
            )
        }
        other => return Err(PipelineError::NotAModelStep(other)),
    };

    Ok(GuardedRequest {
        module: step.as_str().to_string(),
        model: model.to_string(),
        prompt,
        system_instruction: ANALYST_INSTRUCTION.to_string(),
        schema_hint: schema_hint(step).map(str::to_string),
        required_keys: required_keys(step).iter().map(|k| k.to_string()).collect(),
    })
}

/// Build the free-form request that compiles the final package
pub fn final_package_request(
    lead: &Lead,
    context: &PipelineContext,
    model: &str,
) -> Result<GenerationRequest, PipelineError> {
    let step = StepName::FinalPackageAssembly;
    let enrichment = PipelineContext::require(&context.enrichment, step, StepName::Enrichment)?;
    let persona = PipelineContext::require(&context.persona, step, StepName::PersonaGeneration)?;
    let offer = PipelineContext::require(&context.offer, step, StepName::OfferGeneration)?;
    let outreach = PipelineContext::require(&context.outreach, step, StepName::OutreachGeneration)?;

    Ok(GenerationRequest {
        module: step.as_str().to_string(),
        model: model.to_string(),
        prompt: format!(
            "Compile a sales package in markdown for {} with sections: Company, Decision Maker, \
             Offer, Outreach.\n\nResearch:\n{}\n\nPersona:\n{}\n\nOffer:\n{}\n\nOutreach:\n{}",
            lead.business_name,
            pretty(enrichment),
            pretty(persona),
            pretty(offer),
            pretty(outreach)
        ),
        system_instruction: "You are a sales operations writer. Produce clean markdown only."
            .to_string(),
        schema_hint: None,
    })
}

/// Text recorded by the completion step
pub fn completion_note(lead: &Lead, run_id: Uuid) -> String {
    format!(
        "Run {} completed for {} ({}); lead released for follow-up.",
        run_id, lead.business_name, lead.id
    )
}
