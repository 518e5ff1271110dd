use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use serde_json::{Map, Value, json};
use tracewrap_core::{
    config::Config,
    dispatch::Dispatcher,
    handler::DefaultSpanHandler,
    scope,
    sink::MemorySink,
    span::Tracer,
    target::{
        AccessorBundle, AccessorValue, AttributeSpec, CallInputs, EntityGroup, EventAttributeSpec,
        EventSpec, InstrumentationTarget, OutputSchema, Phase,
    },
};

#[derive(Parser)]
#[command(author, version, about = "tracewrap CLI smoke tool", long_about = None)]
struct Cli {
    /// Optional config file (TOML or JSON)
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a nested pair of traced calls and dump the spans
    Demo {
        #[arg(long, default_value = "gpt-4")]
        model: String,
    },
    /// Trace a synthetic token stream (prints deltas live)
    DemoStream {
        #[arg(short, long, default_value = "Hello from tracewrap")]
        message: String,
    },
}

fn inference_schema() -> OutputSchema {
    OutputSchema {
        span_type: Some("inference".to_string()),
        groups: vec![EntityGroup::new(vec![
            AttributeSpec::new(
                "name",
                Phase::Pre,
                Arc::new(|b: &AccessorBundle<'_>| {
                    let model = b
                        .inputs
                        .kwarg("model")
                        .and_then(Value::as_str)
                        .ok_or_else(|| anyhow::anyhow!("model kwarg missing"))?;
                    Ok(AccessorValue::str(model))
                }),
            ),
            AttributeSpec::new(
                "completion_tokens",
                Phase::Post,
                Arc::new(|b: &AccessorBundle<'_>| {
                    let tokens = b
                        .result
                        .and_then(|r| r.pointer("/usage/completion_tokens"))
                        .and_then(Value::as_i64)
                        .ok_or_else(|| anyhow::anyhow!("usage missing"))?;
                    Ok(AccessorValue::int(tokens))
                }),
            ),
        ])],
        events: vec![EventSpec::new(
            "data.output",
            vec![EventAttributeSpec {
                attribute: Some("response".to_string()),
                accessor: Arc::new(|b: &AccessorBundle<'_>| {
                    let text = b
                        .result
                        .and_then(|r| r.get("output_text"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    Ok(AccessorValue::str(text))
                }),
            }],
        )],
        ..Default::default()
    }
}

fn dump_spans(sink: &MemorySink) -> anyhow::Result<()> {
    for span in sink.finished() {
        println!("{}", serde_json::to_string_pretty(&span)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };

    // The demo always captures in memory so it can print what it traced;
    // a real embedding would use cfg.build_sink().
    let sink = Arc::new(MemorySink::default());
    let tracer = Tracer::new(sink.clone(), cfg.service_name.clone());
    let dispatcher = Dispatcher::new(tracer);

    match cli.command {
        Commands::Demo { model } => {
            let pipeline = Arc::new(
                InstrumentationTarget::new("demo", "Pipeline", "run", Arc::new(DefaultSpanHandler))
                    .as_workflow(),
            );
            let inference = Arc::new(
                InstrumentationTarget::new("demo", "Chat", "create", Arc::new(DefaultSpanHandler))
                    .with_schema(inference_schema()),
            );

            let mut kwargs = Map::new();
            kwargs.insert("model".to_string(), json!(model));
            let inputs = CallInputs::new(Value::Null, vec![], kwargs);

            let result = scope::with_scope("session", None, || {
                dispatcher.call(&pipeline, CallInputs::default(), || {
                    dispatcher.call(&inference, inputs, || {
                        Ok(json!({
                            "output_text": "Hi! How can I help?",
                            "usage": {"completion_tokens": 6}
                        }))
                    })
                })
            });
            match result {
                Ok(value) => println!("call returned: {value}"),
                Err(e) => eprintln!("call failed: {e}"),
            }
            dump_spans(&sink)?;
        }
        Commands::DemoStream { message } => {
            let target = Arc::new(
                InstrumentationTarget::new("demo", "Chat", "stream", Arc::new(DefaultSpanHandler))
                    .with_schema(inference_schema()),
            );

            let chunks: Vec<Value> = message
                .split_inclusive(' ')
                .map(|word| json!({"choices": [{"delta": {"content": word}}]}))
                .chain(std::iter::once(json!({
                    "choices": [{"delta": {}, "finish_reason": "stop"}],
                    "usage": {"completion_tokens": 5}
                })))
                .collect();

            let mut stream = dispatcher
                .call_stream_async(&target, CallInputs::default(), async {
                    Ok(futures_util::stream::iter(chunks))
                })
                .await?;

            use std::io::Write;
            while let Some(item) = stream.next().await {
                if let Some(delta) = item.pointer("/choices/0/delta/content").and_then(Value::as_str)
                {
                    print!("{delta}");
                    std::io::stdout().flush().ok();
                }
            }
            println!();
            dump_spans(&sink)?;
        }
    }

    Ok(())
}
