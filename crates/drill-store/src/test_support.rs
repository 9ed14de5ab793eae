//! Record builders shared by the store tests.

use chrono::Utc;

use crate::model::{Assessment, Attempt, Exercise, ExerciseType, Module, Session, SkillLevel};

pub fn module_with(exercises: usize) -> Module {
    let exercises = (1..=exercises)
        .map(|n| Exercise {
            sequence: u32::try_from(n).unwrap_or(u32::MAX),
            exercise_type: ExerciseType::Analysis,
            name: Some(format!("Exercise {n}")),
            prompt: format!("Explain concept {n}"),
            material: None,
            options: None,
            scaffold: None,
            hints: Vec::new(),
            validation_criteria: serde_json::json!(["mentions trade-offs"]),
            model_answer: "A model answer".to_string(),
            model_explanation: "Why it works".to_string(),
            estimated_minutes: Some(5),
        })
        .collect();
    Module::new("Pricing", "economics", SkillLevel::Beginner, "owner-1", exercises)
}

pub fn session_for(module: &Module) -> Session {
    Session::new("learner-1", module.id.clone())
}

pub fn attempt(exercise_index: usize, attempt_number: u32) -> Attempt {
    Attempt {
        exercise_index,
        attempt_number,
        answer_text: "An answer that is long enough".to_string(),
        time_spent_seconds: 42,
        hints_used: 0,
        assessment: Assessment::Developing,
        internal_score: 65,
        feedback: "Getting there".to_string(),
        should_advance: false,
        created_at: Utc::now(),
    }
}
