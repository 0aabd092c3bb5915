//! Property tests for serial composition and the flat-list driver.

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use proptest::prelude::*;
use summon::{Runner, Step, Task};

type Journal = Arc<Mutex<Vec<String>>>;

fn step(journal: &Journal, index: usize, fails: bool) -> Task {
    let forward = journal.clone();
    let cleanup = journal.clone();
    Step::new(format!("s{index}"))
        .action(move |_| {
            let forward = forward.clone();
            async move {
                forward.lock().unwrap().push(format!("do:{index}"));
                if fails {
                    Err(anyhow!("step {index} failed"))
                } else {
                    Ok(())
                }
            }
        })
        .cleanup(move |_| {
            let cleanup = cleanup.clone();
            async move {
                cleanup.lock().unwrap().push(format!("defer:{index}"));
                Ok(())
            }
        })
        .into()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn serial_stops_at_first_failure_and_cleans_up_once(len in 1usize..12, fail_at in proptest::option::of(0usize..12)) {
        let fail_at = fail_at.filter(|k| *k < len);
        let journal: Journal = Arc::default();
        let tasks: Vec<Task> = (0..len).map(|i| step(&journal, i, Some(i) == fail_at)).collect();

        let result = runtime().block_on(Runner::default().run(&Task::serial("all", tasks)));

        let last = fail_at.unwrap_or(len - 1);
        let mut expected: Vec<String> = (0..=last).map(|i| format!("do:{i}")).collect();
        expected.extend((0..=last).map(|i| format!("defer:{i}")));
        prop_assert_eq!(journal.lock().unwrap().clone(), expected);

        match fail_at {
            Some(k) => {
                let err = result.unwrap_err();
                let expected_task = format!("s{k}");
                prop_assert_eq!(err.task(), Some(expected_task.as_str()));
            }
            None => prop_assert!(result.is_ok()),
        }
    }

    #[test]
    fn flat_list_unwinds_in_reverse(len in 1usize..12, fail_at in proptest::option::of(0usize..12)) {
        let fail_at = fail_at.filter(|k| *k < len);
        let journal: Journal = Arc::default();
        let tasks: Vec<Task> = (0..len).map(|i| step(&journal, i, Some(i) == fail_at)).collect();

        let result = runtime().block_on(Runner::default().run_steps(&tasks));

        let last = fail_at.unwrap_or(len - 1);
        let mut expected: Vec<String> = (0..=last).map(|i| format!("do:{i}")).collect();
        expected.extend((0..=last).rev().map(|i| format!("defer:{i}")));
        prop_assert_eq!(journal.lock().unwrap().clone(), expected);
        prop_assert_eq!(result.is_err(), fail_at.is_some());
    }
}
