//! Property-based coverage for the three invariants that are cheaper
//! to state as "for all inputs" than as a handful of fixed examples:
//! prompt assembly purity, namespace derivation idempotence, and a
//! queue enqueue/get round-trip.

use proptest::prelude::*;

use taskdaemon::domain::{TaskRecord, TaskType};
use taskdaemon::namespace::derive_from_path;
use taskdaemon::prompts::{PromptAssembler, PromptLoader};
use taskdaemon::prompts::{TaskGroupContext, TemplateContext};
use taskdaemon::queue::QueueStore;

fn arb_path_component() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_ -]{1,40}"
}

proptest! {
    /// Deriving a namespace from the same path twice always yields
    /// the same string, regardless of what that path happens to be.
    #[test]
    fn namespace_derivation_is_idempotent(folder in arb_path_component()) {
        let path = format!("/home/user/projects/{folder}");
        let a = derive_from_path(&path);
        let b = derive_from_path(&path);
        prop_assert_eq!(a, b);
    }

    /// Assembling a prompt from the same user input and context
    /// twice, with a freshly constructed assembler each time, always
    /// produces the same joined text.
    #[test]
    fn prompt_assembly_is_pure(input in "[^\\x00]{1,200}") {
        prop_assume!(!input.trim().is_empty());
        let group = TaskGroupContext {
            group_id: "g1".to_string(),
            working_files: vec!["src/lib.rs".to_string()],
            last_task_result: None,
            conversation_entries: vec!["previous turn".to_string()],
        };
        let template = TemplateContext::default();

        let a = PromptAssembler::new(PromptLoader::embedded_only()).assemble(&input, &group, &template).unwrap();
        let b = PromptAssembler::new(PromptLoader::embedded_only()).assemble(&input, &group, &template).unwrap();
        prop_assert_eq!(a.joined(), b.joined());
    }
}

/// A record that's enqueued is returned unchanged (apart from its
/// actor-assigned status/timestamps) by a subsequent get, across a
/// range of arbitrary task ids and prompts.
#[tokio::test]
async fn queue_round_trip_holds_across_varied_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let queue = QueueStore::spawn(dir.path()).unwrap();

    for (i, prompt) in ["fix the bug", "explain this module", "", "a very long prompt ".repeat(20).trim()].into_iter().enumerate() {
        if prompt.is_empty() {
            continue;
        }
        let task_id = format!("round-trip-{i}");
        let seq = queue.next_seq();
        let record = TaskRecord::new(task_id.clone(), "default", "s1", "th1", None, TaskType::ReadInfo, prompt, seq);
        queue.enqueue(record.clone()).await.unwrap();

        let fetched = queue.get(&task_id).await.unwrap().unwrap();
        assert_eq!(fetched.task_id, record.task_id);
        assert_eq!(fetched.prompt, record.prompt);
        assert_eq!(fetched.namespace, record.namespace);
        assert_eq!(fetched.task_type, record.task_type);
    }
}
