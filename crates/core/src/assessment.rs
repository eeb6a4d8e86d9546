use crate::chat::ChatModel;
use crate::conversation::{Speaker, Turn};
use crate::persona::Persona;

/// Fallback sent when there is no assessment to give, either because the
/// conversation was too short or the coach model failed.
pub const ASSESSMENT_FALLBACK: &str = "Not enough conversation to generate an assessment. Try having a longer sales conversation next time!";

/// System prompt for the fresh coach model instance. The session's own chat
/// memory is never reused for coaching so the persona conversation and the
/// evaluation prompt cannot cross-contaminate.
pub const COACH_SYSTEM_PROMPT: &str =
    "You are an expert sales coach providing constructive feedback.";

/// Minimum number of recorded turns before an assessment is worth generating.
const MIN_TURNS: usize = 2;

/// Build the coaching-evaluation prompt from the recorded history.
///
/// Returns `None` when the history holds fewer than two turns; in that case
/// no model call should be made at all. User turns are relabeled "Seller" and
/// assistant turns carry the persona's display name.
pub fn build_prompt(history: &[Turn], persona: &Persona) -> Option<String> {
    if history.len() < MIN_TURNS {
        return None;
    }

    let transcript = history
        .iter()
        .map(|turn| {
            let label = match turn.role {
                Speaker::User => "Seller",
                Speaker::Assistant => persona.name,
            };
            format!("{label}: {}", turn.text)
        })
        .collect::<Vec<_>>()
        .join("\n");

    Some(format!(
        r#"You are a sales coach evaluating a student's value-based selling practice session.

The student was practicing selling to a buyer ({persona_name} - {persona_description}).

Here is the conversation transcript:
---
{transcript}
---

Please provide a coaching assessment with the following sections:

1. **Overall Score**: Rate the pitch from 1-10

2. **Summary**: Brief 2-3 sentence summary of how the conversation went

3. **Strongest Points**:
   - List 2-3 things the student did well
   - Be specific with examples from the conversation

4. **Areas for Improvement**:
   - List 2-3 things the student could improve
   - Provide specific suggestions

5. **Key Opportunities Missed**:
   - Did the student uncover the buyer's pain points?
   - Did they quantify the value/ROI?
   - Did they ask open-ended questions?

6. **One Key Tip**: The single most important thing to focus on next time

Keep the feedback constructive and encouraging. Format it nicely for display."#,
        persona_name = persona.name,
        persona_description = persona.description,
    ))
}

/// Generate the coaching assessment over a fresh chat model instance.
///
/// The factory is only invoked once a prompt exists, so a too-short history
/// never constructs a coach at all. Yields `None` when the history is too
/// short or the coach model fails; the caller supplies the fallback message.
pub async fn generate<C, F>(history: &[Turn], persona: &Persona, coach_factory: &F) -> Option<String>
where
    C: ChatModel,
    F: Fn(&str) -> C,
{
    let prompt = build_prompt(history, persona)?;
    let mut coach = coach_factory(COACH_SYSTEM_PROMPT);

    match coach.send(&prompt).await {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::error!("Failed to generate assessment: {:?}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MockChatModel;
    use crate::persona;
    use chrono::Utc;

    fn turn(role: Speaker, text: &str) -> Turn {
        Turn {
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn short_history_yields_no_prompt() {
        let persona = persona::lookup("buyer");
        assert!(build_prompt(&[], persona).is_none());
        assert!(build_prompt(&[turn(Speaker::User, "hello")], persona).is_none());
    }

    #[test]
    fn prompt_labels_turns_by_role() {
        let persona = persona::lookup("buyer");
        let history = vec![
            turn(Speaker::User, "Hi, I sell eco clips."),
            turn(Speaker::Assistant, "Tell me more."),
        ];

        let prompt = build_prompt(&history, persona).unwrap();
        assert!(prompt.contains("Seller: Hi, I sell eco clips."));
        assert!(prompt.contains("Operations Manager: Tell me more."));
        assert!(prompt.contains("sales coach"));
    }

    #[tokio::test]
    async fn short_history_never_constructs_the_coach() {
        let persona = persona::lookup("buyer");
        let factory = |_: &str| -> MockChatModel {
            panic!("coach must not be constructed for a short history")
        };

        let result = generate(&[turn(Speaker::User, "hello")], persona, &factory).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn coach_reply_is_returned_verbatim() {
        let persona = persona::lookup("buyer");
        let history = vec![
            turn(Speaker::User, "pitch"),
            turn(Speaker::Assistant, "reply"),
        ];

        let factory = |system_prompt: &str| {
            assert_eq!(system_prompt, COACH_SYSTEM_PROMPT);
            let mut coach = MockChatModel::new();
            coach
                .expect_send()
                .once()
                .returning(|_| Box::pin(async { Ok("Overall Score: 7/10".to_string()) }));
            coach
        };

        let result = generate(&history, persona, &factory).await;
        assert_eq!(result, Some("Overall Score: 7/10".to_string()));
    }

    #[tokio::test]
    async fn coach_failure_yields_none() {
        let persona = persona::lookup("buyer");
        let history = vec![
            turn(Speaker::User, "pitch"),
            turn(Speaker::Assistant, "reply"),
        ];

        let factory = |_: &str| {
            let mut coach = MockChatModel::new();
            coach
                .expect_send()
                .once()
                .returning(|_| Box::pin(async { Err(anyhow::anyhow!("rate limited")) }));
            coach
        };

        assert!(generate(&history, persona, &factory).await.is_none());
    }
}
