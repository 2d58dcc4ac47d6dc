//! Property tests for the history window, stop-marker stripping and the
//! output length bound

mod common;

use common::{CharTokenizer, ScriptedModel, BOS};
use proptest::prelude::*;
use std::sync::Arc;
use tandem_core::generation::{GenerationLoop, PartialOutput};
use tandem_core::model;
use tandem_core::relay::normalize_partial;
use tandem_core::session::{window, ChatSession, PromptTemplate, Turn};
use tandem_core::sync::{pack_payload, unpack_payload, Request, SyncedRequest};

const STOP: &str = "### User";

fn template() -> PromptTemplate {
    PromptTemplate {
        preamble: "PRE".to_string(),
        user_tag: STOP.to_string(),
        assistant_tag: "### Dromedary".to_string(),
    }
}

fn synced(max_output_length: usize) -> SyncedRequest {
    SyncedRequest {
        sequence: 1,
        request: Request {
            payload: "q".to_string(),
            temperature: 0.0,
            top_p: 1.0,
            max_output_length,
            stop_marker: STOP.to_string(),
        },
        prompt_tokens: vec![BOS, u32::from('q')],
        truncated: None,
    }
}

// Replies drawn from a small alphabet that can spell the stop marker
fn reply_text() -> impl Strategy<Value = String> {
    proptest::collection::vec(
        prop_oneof![
            Just("### User".to_string()),
            Just("\n\n".to_string()),
            Just("#".to_string()),
            "[a-z ]{1,6}",
        ],
        0..12,
    )
    .prop_map(|parts| parts.concat())
}

proptest! {
    #[test]
    fn window_keeps_the_most_recent_turns(total in 0usize..40, history_length in 1usize..12) {
        let history: Vec<Turn> = (0..total)
            .map(|i| Turn::completed(format!("u{i}"), format!("a{i}")))
            .collect();
        let kept = window(&history, history_length);

        prop_assert_eq!(kept.len(), total.min(history_length));
        prop_assert_eq!(kept, &history[total - kept.len()..]);
    }

    #[test]
    fn session_never_exceeds_its_window(messages in 1usize..30, history_length in 1usize..8) {
        let mut session = ChatSession::new(template(), history_length);
        for i in 0..messages {
            session.push_user(format!("m{i}"));
            session.apply_partial("reply");
            prop_assert!(session.turns().len() <= history_length);
        }
        let last = session.turns().last().unwrap();
        prop_assert_eq!(&last.user, &format!("m{}", messages - 1));
    }

    #[test]
    fn normalized_text_never_contains_the_stop_marker(text in reply_text()) {
        let normalized = normalize_partial(&text, STOP);
        prop_assert!(!normalized.contains(STOP));
    }

    #[test]
    fn emitted_tokens_never_exceed_the_bound(text in reply_text(), bound in 1usize..40) {
        let generator = GenerationLoop::new(
            model::shared(Box::new(ScriptedModel::new(&text))),
            Arc::new(CharTokenizer),
            512,
        );
        let mut units: Vec<PartialOutput> = Vec::new();
        let outcome = generator.run(&synced(bound), &mut units).unwrap();

        prop_assert!(outcome.tokens.len() <= bound);
        prop_assert!(units.iter().all(|u| u.tokens.len() <= bound));
        prop_assert!(units.len() <= bound + 1);
    }

    #[test]
    fn payload_prefix_survives_packing(
        tokens in proptest::collection::vec(0u32..50_000, 0..64),
        capacity in 1usize..48,
    ) {
        let (buf, truncated) = pack_payload(&tokens, capacity);
        let unpacked = unpack_payload(buf.as_i64().unwrap()).unwrap();

        let kept = tokens.len().min(capacity);
        prop_assert_eq!(&unpacked[..], &tokens[..kept]);
        prop_assert_eq!(truncated.is_some(), tokens.len() > capacity);
    }
}
