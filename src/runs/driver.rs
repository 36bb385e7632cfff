//! Drive a run to completion by answering its loads and calls.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::{Run, RunError, RunResult, RunState, RunUpdate};
use crate::lang::{Bindings, LangResult};
use crate::values::{Kwargs, Value};

/// Owner-side answers to a run's suspensions.
#[async_trait]
pub trait RunHandler: Send + Sync {
    /// Resolve a module load.
    async fn load(&self, path: &str) -> LangResult<Bindings>;

    /// Perform an external call.
    async fn call(&self, function: Value, args: Vec<Value>, kwargs: Kwargs) -> LangResult<Value>;

    /// Observe printed output.
    async fn print(&self, _text: &str) -> LangResult<()> {
        Ok(())
    }
}

/// Consume a run's updates, answering each suspension through `handler`,
/// until the run reaches a final state.
pub async fn drive(
    run: &Arc<Run>,
    updates: &mut mpsc::UnboundedReceiver<RunUpdate>,
    handler: &dyn RunHandler,
) -> RunResult<RunState> {
    loop {
        let Some(update) = updates.recv().await else {
            // all senders dropped: the run is gone, report whatever it reached
            return Ok(run.wait().await);
        };
        trace!(run_id = %update.run_id, state = update.next.name(), "driving run");
        match update.next {
            RunState::LoadWait { path } => {
                let result = handler.load(&path).await;
                tolerate_final(run, run.return_load(result))?;
            }
            RunState::CallWait {
                function,
                args,
                kwargs,
            } => {
                let result = handler.call(function, args, kwargs).await;
                tolerate_final(run, run.return_call(result))?;
            }
            RunState::Print { text } => {
                // print failures are not fatal to the run
                if let Err(err) = handler.print(&text).await {
                    warn!(run_id = %run.id(), error = %err, "print handler failed");
                }
            }
            state if state.is_final() => return Ok(state),
            _ => {}
        }
    }
}

fn tolerate_final(run: &Run, result: RunResult<()>) -> RunResult<()> {
    match result {
        Err(RunError::WrongState { .. }) if run.state().is_final() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogConfig;
    use crate::lang::catalog::Catalog;
    use crate::lang::sexpr::SexprLang;
    use crate::lang::{Lang, LangError};
    use crate::runs::{Runs, channel_sink};
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        prints: Mutex<Vec<String>>,
        refuse_prints: bool,
    }

    #[async_trait]
    impl RunHandler for Recorder {
        async fn load(&self, path: &str) -> LangResult<Bindings> {
            Err(LangError::NotFound(path.to_string()))
        }

        async fn call(
            &self,
            function: Value,
            args: Vec<Value>,
            _kwargs: Kwargs,
        ) -> LangResult<Value> {
            self.calls.lock().push(function.to_string());
            Ok(Value::Integer(args.len() as i64))
        }

        async fn print(&self, text: &str) -> LangResult<()> {
            self.prints.lock().push(text.to_string());
            if self.refuse_prints {
                return Err(LangError::Client("print sink closed".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn drive_answers_calls_until_completed() {
        let module = SexprLang::new()
            .compile_module("main.sx", b"(print \"hi\")\n(def n (ext 1 2 3))", &["ext".into()])
            .await
            .unwrap();
        let runs = Runs::new(Arc::new(Catalog::with_builtin_langs(&CatalogConfig::default())));
        let (sink, mut rx) = channel_sink();
        let mut predecls = Bindings::new();
        predecls.insert(
            "ext".into(),
            Value::Builtin(crate::values::CallValue::new(
                &crate::values::ExecutorId::new("test"),
                "ext",
                &[],
            )),
        );
        let run = runs
            .run_module(&CancellationToken::new(), None, "s", &module, predecls, sink)
            .await
            .unwrap();

        let recorder = Recorder::default();
        let state = drive(&run, &mut rx, &recorder).await.unwrap();
        match state {
            RunState::Completed { bindings, .. } => {
                assert_eq!(bindings.get("n"), Some(&Value::Integer(3)))
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(recorder.calls.lock().len(), 1);
        assert_eq!(*recorder.prints.lock(), vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn failed_loads_surface_as_errors() {
        let module = SexprLang::new()
            .compile_module("main.sx", b"(load \"missing.sx\" x)", &[])
            .await
            .unwrap();
        let runs = Runs::new(Arc::new(Catalog::with_builtin_langs(&CatalogConfig::default())));
        let (sink, mut rx) = channel_sink();
        let run = runs
            .run_module(&CancellationToken::new(), None, "s", &module, Bindings::new(), sink)
            .await
            .unwrap();
        let state = drive(&run, &mut rx, &Recorder::default()).await.unwrap();
        assert!(matches!(state, RunState::Error { .. }));
    }

    #[tokio::test]
    async fn print_failures_do_not_stop_the_run() {
        let module = SexprLang::new()
            .compile_module("main.sx", b"(print \"a\")\n(print \"b\")\n(def done true)", &[])
            .await
            .unwrap();
        let runs = Runs::new(Arc::new(Catalog::with_builtin_langs(&CatalogConfig::default())));
        let (sink, mut rx) = channel_sink();
        let run = runs
            .run_module(&CancellationToken::new(), None, "s", &module, Bindings::new(), sink)
            .await
            .unwrap();
        let recorder = Recorder {
            refuse_prints: true,
            ..Recorder::default()
        };
        let state = drive(&run, &mut rx, &recorder).await.unwrap();
        assert!(matches!(state, RunState::Completed { .. }));
        assert_eq!(*recorder.prints.lock(), vec!["a".to_string(), "b".to_string()]);
    }
}
