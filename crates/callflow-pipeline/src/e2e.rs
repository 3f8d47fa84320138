//! End-to-end scenarios: a full processor chain on a real orchestrator
//! with scripted vendors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use callflow_config::{PipelineConfig, SummaryConfig, ToolsConfig};
use callflow_core::{
    meta, ControlCode, Frame, FrameKind, Meta, Result, StreamingStt, StreamingTts, ToolRegistry,
    ToolSpec,
};

use crate::aggregator::AggregatorConfig;
use crate::orchestrator::Orchestrator;
use crate::processors::{
    ContextProcessor, DtmfDisambiguator, DtmfDisambiguatorConfig, LlmProcessor, SttProcessor,
    SummaryProcessor, ToolDispatcher, TtsProcessor,
};
use crate::testutil::{MockLlm, MockStt, MockTts};
use crate::turn::{AggressiveStrategy, TurnProcessor, TurnProcessorConfig};

struct EchoTool {
    confirm: bool,
}

#[async_trait]
impl ToolRegistry for EchoTool {
    fn tools(&self) -> Vec<ToolSpec> {
        let mut tool = ToolSpec::new("schedule_visit", "Schedule a technician visit");
        tool.requires_confirmation = self.confirm;
        tool.confirmation_prompt = Some(
            "Sebelum saya jadwalkan kunjungan, apakah Anda ingin saya lanjutkan?".to_string(),
        );
        vec![tool]
    }

    async fn handle_tool(&self, _name: &str, args: serde_json::Value) -> Result<String> {
        Ok(serde_json::json!({"scheduled": true, "args": args}).to_string())
    }
}

struct Fixture {
    orch: Arc<Orchestrator>,
    stt: Arc<MockStt>,
    tts: Arc<MockTts>,
    llm: Arc<MockLlm>,
    llm_proc: Arc<LlmProcessor>,
    sink: Arc<Mutex<Vec<Frame>>>,
}

fn build_fixture(confirm_tool: bool) -> Fixture {
    let stt = MockStt::new();
    let tts = MockTts::new();
    let llm = MockLlm::new();

    let orch = Orchestrator::new(PipelineConfig::default(), CancellationToken::new());

    let stt_session = stt.clone();
    let stt_proc = Arc::new(SttProcessor::new(Arc::new(move |_c, _s| {
        stt_session.clone() as Arc<dyn StreamingStt>
    })));
    let turn_proc = Arc::new(TurnProcessor::new(
        Arc::new(AggressiveStrategy),
        TurnProcessorConfig::default(),
    ));
    let context_proc = Arc::new(ContextProcessor::new(
        AggregatorConfig::default(),
        "Kamu asisten layanan HVAC.",
    ));
    context_proc.set_turn_manager(&turn_proc.manager());

    let registry = Arc::new(EchoTool {
        confirm: confirm_tool,
    });
    let tools = registry.tools();
    let llm_proc = Arc::new(LlmProcessor::new(llm.clone(), "", tools));
    let dispatcher = Arc::new(ToolDispatcher::new(
        registry,
        orch.input(),
        ToolsConfig::default(),
    ));
    let summary_proc = Arc::new(SummaryProcessor::new(SummaryConfig {
        enabled: true,
        ..Default::default()
    }));
    let tts_session = tts.clone();
    let tts_proc = Arc::new(TtsProcessor::new(Arc::new(move |_c, _s| {
        tts_session.clone() as Arc<dyn StreamingTts>
    })));

    orch.add_processor(stt_proc);
    orch.add_processor(turn_proc);
    orch.add_processor(Arc::new(DtmfDisambiguator::new(
        DtmfDisambiguatorConfig::default(),
    )));
    orch.add_processor(context_proc);
    orch.add_processor(llm_proc.clone());
    orch.add_processor(dispatcher);
    orch.add_processor(summary_proc);
    orch.add_processor(tts_proc);

    let sink: Arc<Mutex<Vec<Frame>>> = Arc::new(Mutex::new(Vec::new()));
    let collected = sink.clone();
    orch.set_sink(move |frame| {
        collected.lock().push(frame.clone());
    });
    orch.start().unwrap();

    Fixture {
        orch,
        stt,
        tts,
        llm,
        llm_proc,
        sink,
    }
}

fn call_start() -> Frame {
    let mut m = Meta::new();
    m.insert(meta::CALL_SID.to_string(), "CA1".to_string());
    m.insert(meta::TRACE_ID.to_string(), "TR1".to_string());
    Frame::system("S1", 1, "call_start", m)
}

fn call_end() -> Frame {
    let mut m = Meta::new();
    m.insert(meta::CALL_SID.to_string(), "CA1".to_string());
    Frame::system("S1", 999, "call_end", m)
}

fn audio_chunk() -> Frame {
    let mut m = Meta::new();
    m.insert(meta::CALL_SID.to_string(), "CA1".to_string());
    m.insert(meta::TRACE_ID.to_string(), "TR1".to_string());
    Frame::audio("S1", 0, vec![0u8; 160], 8000, 1, m)
}

fn dtmf(digit: &str) -> Frame {
    let mut m = Meta::new();
    m.insert(meta::DTMF_DIGIT.to_string(), digit.to_string());
    m.insert(meta::CALL_SID.to_string(), "CA1".to_string());
    Frame::control("S1", 0, ControlCode::Dtmf, m)
}

async fn wait_for<F: Fn(&[Frame]) -> bool>(sink: &Arc<Mutex<Vec<Frame>>>, cond: F) {
    for _ in 0..200 {
        if cond(&sink.lock()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let names: Vec<String> = sink
        .lock()
        .iter()
        .map(|f| format!("{:?}:{}{}", f.kind(), f.system_name(), {
            f.control_code().map(|c| c.as_str()).unwrap_or("")
        }))
        .collect();
    panic!("condition not met; sink = {names:?}");
}

#[tokio::test]
async fn happy_path_produces_greeting_flow() {
    let f = build_fixture(false);
    f.llm.set_reply("Hai, ada yang bisa dibantu?");
    f.tts.push_audio(vec![9u8; 160]);

    let input = f.orch.input();
    input.send(call_start()).await.unwrap();
    for _ in 0..5 {
        input.send(audio_chunk()).await.unwrap();
    }
    f.stt.push_speech_started();
    f.stt.push_final("halo");
    // The final surfaces on this audio's drain; the next chunk carries the
    // speculative flush into the LLM.
    input.send(audio_chunk()).await.unwrap();
    for _ in 0..4 {
        input.send(audio_chunk()).await.unwrap();
    }

    wait_for(&f.sink, |frames| {
        frames.iter().any(|fr| fr.kind() == FrameKind::Audio)
    })
    .await;

    input.send(call_end()).await.unwrap();
    wait_for(&f.sink, |frames| {
        frames.iter().any(|fr| fr.system_name() == "call_summary")
    })
    .await;

    let frames = f.sink.lock();
    assert_eq!(
        frames
            .iter()
            .filter(|fr| fr.system_name() == "base_prompt")
            .count(),
        1,
        "base prompt exactly once"
    );
    assert!(frames
        .iter()
        .any(|fr| fr.control_code() == Some(ControlCode::StartInterruption)));
    let llm_chunks: Vec<&Frame> = frames
        .iter()
        .filter(|fr| fr.meta_value(meta::SOURCE) == "llm" && fr.kind() == FrameKind::Text)
        .collect();
    assert!(!llm_chunks.is_empty());
    assert!(llm_chunks
        .iter()
        .any(|fr| fr.meta_value(meta::TTS_FLUSH) == "true"));
    assert!(frames.iter().any(|fr| fr.kind() == FrameKind::Audio));
    assert!(frames.iter().any(|fr| fr.system_name() == "call_summary"));
    f.orch.stop();
}

#[tokio::test]
async fn tool_confirmation_roundtrip_dispatches_after_yes() {
    let f = build_fixture(true);
    f.llm.set_response(callflow_core::LlmResponse {
        tool_calls: vec![callflow_core::ToolCall {
            id: "call-1".to_string(),
            name: "schedule_visit".to_string(),
            arguments: serde_json::json!({"when": "besok"}),
        }],
        ..Default::default()
    });
    f.tts.push_audio(vec![7u8; 160]);

    let input = f.orch.input();
    input.send(call_start()).await.unwrap();
    f.stt.push_speech_started();
    f.stt.push_final("tolong jadwalkan kunjungan teknisi");
    input.send(audio_chunk()).await.unwrap();
    input.send(audio_chunk()).await.unwrap();

    wait_for(&f.sink, |frames| {
        frames
            .iter()
            .any(|fr| fr.meta_value(meta::GREETING_TEXT).starts_with("Sebelum saya jadwalkan"))
    })
    .await;
    // The prompt is actually spoken: its Text rewrite reaches the sink and
    // the vendor's synthesized audio follows it out.
    wait_for(&f.sink, |frames| {
        frames.iter().any(|fr| {
            fr.kind() == FrameKind::Text
                && matches!(fr, Frame::Text { text, .. } if text.starts_with("Sebelum saya jadwalkan"))
                && fr.meta_value(meta::SOURCE) == "llm"
        })
    })
    .await;
    wait_for(&f.sink, |frames| {
        frames.iter().any(|fr| fr.kind() == FrameKind::Audio)
    })
    .await;
    assert!(
        !f.sink
            .lock()
            .iter()
            .any(|fr| fr.control_code() == Some(ControlCode::ToolCall)),
        "no dispatch before the user confirms"
    );

    // The follow-up answer after the tool result.
    f.llm.set_reply("Kunjungan teknisi sudah dijadwalkan besok.");
    f.stt.push_speech_started();
    f.stt.push_final("ya");
    input.send(audio_chunk()).await.unwrap();
    input.send(audio_chunk()).await.unwrap();

    wait_for(&f.sink, |frames| {
        frames.iter().any(|fr| fr.system_name() == "tool_result")
    })
    .await;
    wait_for(&f.sink, |frames| {
        frames
            .iter()
            .any(|fr| fr.kind() == FrameKind::Text && {
                match fr {
                    Frame::Text { text, .. } => text.contains("sudah dijadwalkan"),
                    _ => false,
                }
            })
    })
    .await;

    let frames = f.sink.lock();
    let call = frames
        .iter()
        .find(|fr| fr.control_code() == Some(ControlCode::ToolCall))
        .expect("tool call dispatched");
    assert!(call.meta_value(meta::TOOL_ARGS).contains("besok"));
    let result = frames
        .iter()
        .find(|fr| fr.system_name() == "tool_result")
        .unwrap();
    assert_eq!(result.meta_value(meta::TOOL_STATUS), "ok");
    f.orch.stop();
}

#[tokio::test]
async fn dtmf_wins_over_spoken_digits() {
    let f = build_fixture(false);
    f.llm.set_reply("Baik, pilihan dua.");

    let input = f.orch.input();
    input.send(call_start()).await.unwrap();
    input.send(dtmf("2")).await.unwrap();
    // The vendor also transcribes the tone as a digits-only final.
    f.stt.push_final("2");
    input.send(audio_chunk()).await.unwrap();
    input.send(audio_chunk()).await.unwrap();

    wait_for(&f.sink, |frames| {
        frames
            .iter()
            .any(|fr| fr.meta_value(meta::SOURCE) == "llm" && fr.kind() == FrameKind::Text)
    })
    .await;

    // The DTMF press became the user turn; the spoken "2" was dropped.
    let history = f.llm_proc.history("call:CA1");
    let user_turns: Vec<&str> = history
        .iter()
        .filter(|m| m.role == callflow_core::Role::User)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(user_turns, vec!["DTMF input: 2"]);
    f.orch.stop();
}
