//! Deterministic feedback, for when the feedback generator lets us down.

use super::{Feedback, FeedbackRequest};

/// Scores at or above this are called out as strengths.
const STRENGTH_THRESHOLD: f64 = 70.0;

/// Build feedback from scores alone. The same request always produces the
/// same feedback, and the result is always usable.
pub fn fallback_feedback(request: &FeedbackRequest<'_>) -> Feedback {
    let mut strengths = vec![];
    let mut improvements = vec![];
    let mut suggestions = vec![];

    let content = request.content.score;
    let structure = request.structure.score;
    let handwriting = request.handwriting.overall;

    if content >= STRENGTH_THRESHOLD {
        strengths.push("Your answer covers the key ideas the question asks for.".to_owned());
    } else {
        improvements.push("Your answer misses some of the key ideas.".to_owned());
    }
    for point in &request.content.covered_points {
        strengths.push(format!("You explained {point}."));
    }
    for point in &request.content.missing_points {
        improvements.push(format!("Include {point}."));
        suggestions.push(format!("Review {point} before your next attempt."));
    }

    if structure >= STRENGTH_THRESHOLD {
        strengths.push("Your answer is clearly organized.".to_owned());
    } else {
        improvements.push("Organize your answer so each point follows from the last.".to_owned());
        suggestions.push("Plan your answer in a few bullet points before writing.".to_owned());
    }

    if handwriting >= STRENGTH_THRESHOLD {
        strengths.push("Your handwriting is easy to read.".to_owned());
    } else {
        improvements.push("Some of your handwriting is hard to read.".to_owned());
        suggestions.push("Write a little more slowly and leave space between words.".to_owned());
    }

    if !request.answer.met_threshold {
        suggestions.push(
            "Parts of your answer could not be read reliably, so your marks may not reflect \
             everything you wrote."
                .to_owned(),
        );
    }

    let detailed_feedback = format!(
        "Overall score: {:.0}/100. Content {:.0}/100, structure {:.0}/100, handwriting \
         {:.0}/100. {}",
        request.overall_score,
        content,
        structure,
        handwriting,
        if improvements.is_empty() {
            "Well done."
        } else {
            "Focus on the improvements listed above."
        },
    );

    Feedback {
        strengths,
        improvements,
        suggestions,
        detailed_feedback,
    }
}
