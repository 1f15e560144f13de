//! Supervisor：判断请求是直接回复还是进入多任务规划
//!
//! 1. 没有用户消息 -> direct
//! 2. 命中文档生成类正则（PPT / 报告 / 表格 / PDF / 图表 / 「全部都做」）-> plan，不调用 LLM
//! 3. 否则调用一次 LLM，从回复中提取 `{"decision", "reason"}`；只有 decision == "plan" 才进入规划，
//!    其它值、解析失败、调用失败或超时一律 direct

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cowork::json::extract_balanced_object;
use crate::cowork::types::Decision;
use crate::llm::{complete_with_timeout, last_user_content, LlmClient, Message, Role};

const CLASSIFIER_PROMPT: &str = r#"You are the supervisor of a multi-agent assistant. Decide how the latest user request should be handled.

Answer "direct" when the request can be answered in a single reply: greetings, questions, explanations, small code snippets, short edits.
Answer "plan" when the request needs several distinct steps or different kinds of work: building a project, research followed by writing, producing files or documents, changes across many files, or any request that explicitly asks for multiple deliverables.

Respond with a single JSON object and nothing else:
{"decision": "direct" | "plan", "reason": "<one short sentence>"}"#;

/// 需要工具链才能完成的请求，直接进入规划
const PLAN_PATTERNS: &[&str] = &[
    r"(?i)\b(make|create|generate|build|prepare|design)\b.*\b(ppt|pptx|powerpoint|slides?|slide deck|presentation)\b",
    r"(?i)\b(write|create|generate|produce|prepare|draft)\b.*\b(report|white ?paper)\b",
    r"(?i)\b(create|generate|make|build|export)\b.*\b(spreadsheet|excel|xlsx|csv)\b",
    r"(?i)\b(create|generate|make|export|convert)\b.*\bpdf\b",
    r"(?i)\b(chart|graph|plot|dashboard|visuali[sz](e|ation))\b",
    r"(?i)\b(do (it )?all|do everything|all of (it|them|the above))\b",
    r"(?i)(生成|制作|做|写|创建|输出|导出).*(ppt|幻灯片|演示文稿|报告|表格|excel|pdf)",
    r"(图表|可视化|数据分析图)",
    r"(全部|所有|都)(做|完成|处理|搞定)",
];

fn plan_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        PLAN_PATTERNS
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Invalid classifier pattern {}: {}", p, e);
                    None
                }
            })
            .collect()
    })
}

/// 是否命中任一强制规划的模式
pub fn matches_plan_pattern(text: &str) -> bool {
    plan_patterns().iter().any(|re| re.is_match(text))
}

#[derive(Debug, Deserialize)]
struct ClassifierReply {
    decision: String,
    #[serde(default)]
    reason: String,
}

/// 解析分类回复；仅 decision == "plan" 时返回 Plan
pub fn parse_decision(output: &str) -> Decision {
    let Some(json) = extract_balanced_object(output) else {
        debug!("Classifier reply has no JSON object");
        return Decision::Direct;
    };
    match serde_json::from_str::<ClassifierReply>(json) {
        Ok(reply) if reply.decision.trim().eq_ignore_ascii_case("plan") => {
            debug!(reason = %reply.reason, "Classifier chose plan");
            Decision::Plan
        }
        Ok(reply) => {
            debug!(decision = %reply.decision, reason = %reply.reason, "Classifier chose direct");
            Decision::Direct
        }
        Err(e) => {
            debug!("Classifier JSON parse failed: {}", e);
            Decision::Direct
        }
    }
}

/// 分类器：持有 LLM 与超时
pub struct Supervisor {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl Supervisor {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    pub async fn classify(&self, messages: &[Message]) -> Decision {
        let Some(request) = last_user_content(messages) else {
            return Decision::Direct;
        };

        if matches_plan_pattern(request) {
            info!("Request matched a document/tooling pattern, escalating to plan");
            return Decision::Plan;
        }

        let mut prompt = vec![Message::system(CLASSIFIER_PROMPT)];
        prompt.extend(messages.iter().filter(|m| m.role != Role::System).cloned());

        match complete_with_timeout(self.llm.as_ref(), &prompt, self.timeout).await {
            Ok(output) => parse_decision(&output),
            Err(e) => {
                warn!("Classifier call failed, falling back to direct: {}", e);
                Decision::Direct
            }
        }
    }
}
