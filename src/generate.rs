//! Structured generation: grounded test cases and Selenium scripts.
//!
//! Both operations retrieve context from the [`KnowledgeBase`], compose a
//! grounding prompt, and make exactly one model call. Test case replies are
//! decoded by [`decode_test_cases`]; script replies are returned as-is apart
//! from an optional surrounding code fence.

use std::sync::Arc;

use crate::config::{GenerationConfig, RetrievalConfig};
use crate::decode::{decode_test_cases, strip_code_fence};
use crate::error::QaResult;
use crate::kb::KnowledgeBase;
use crate::llm::ChatModel;
use crate::models::{RetrievalResult, TestCase};

pub struct Generator {
    kb: Arc<KnowledgeBase>,
    model: Arc<dyn ChatModel>,
    retrieval: RetrievalConfig,
    generation: GenerationConfig,
}

impl Generator {
    pub fn new(
        kb: Arc<KnowledgeBase>,
        model: Arc<dyn ChatModel>,
        retrieval: RetrievalConfig,
        generation: GenerationConfig,
    ) -> Self {
        Self {
            kb,
            model,
            retrieval,
            generation,
        }
    }

    pub fn knowledge_base(&self) -> &Arc<KnowledgeBase> {
        &self.kb
    }

    /// Generate documentation-grounded test cases for `query`.
    ///
    /// Fails with `KnowledgeBaseNotReady` before any model call when no
    /// knowledge base exists.
    pub async fn generate_test_cases(&self, query: &str) -> QaResult<Vec<TestCase>> {
        let context = self.kb.retrieve(query, self.retrieval.k).await?;
        let sources = context.unique_sources();
        let prompt = test_case_prompt(query, &context, &sources);

        let reply = self
            .model
            .complete(&prompt, self.generation.test_case_temperature)
            .await?;
        tracing::info!(
            model = self.model.model_name(),
            reply = %reply.chars().take(200).collect::<String>(),
            "test case reply received"
        );

        decode_test_cases(&reply, &sources, &self.generation.placeholder_sources)
    }

    /// Generate a Selenium script automating `test_case` against the target
    /// page recorded in the knowledge base.
    pub async fn generate_script(&self, test_case: &TestCase) -> QaResult<String> {
        let (page, markup) = self.kb.target_markup(self.retrieval.script_markup_k).await?;
        let context = self
            .kb
            .retrieve(&test_case.test_scenario, self.retrieval.script_context_k)
            .await?;
        let prompt = script_prompt(test_case, &page, &markup, &context);

        let reply = self
            .model
            .complete(&prompt, self.generation.script_temperature)
            .await?;
        tracing::info!(
            model = self.model.model_name(),
            test_id = %test_case.test_id,
            chars = reply.len(),
            "script reply received"
        );
        Ok(strip_code_fence(&reply))
    }
}

fn test_case_prompt(query: &str, context: &RetrievalResult, sources: &[String]) -> String {
    format!(
        r#"You are an expert QA engineer. Generate test cases based strictly on the project documentation and HTML structure below.
Do not invent features, rules, or behavior that the context does not describe.

Context (from documents: {sources}):
<context>
{context}
</context>

User request: "{query}"

Return a JSON array of test case objects. Each object must have exactly these keys:
- "Test_ID": a unique identifier such as "TC-001".
- "Feature": the feature under test, e.g. "Discount Code" or "Cart Summary".
- "Test_Scenario": the steps of the test in detail.
- "Expected_Result": the observable outcome that means the test passed.
- "Grounded_In": a JSON LIST of the document names above that justify the test case, e.g. ["product_specs.md"] or ["ui_ux_guide.txt", "api_endpoints.json"].

Output ONLY the JSON array. No explanations and no markdown fences; the reply must start with [ and end with ].
Example:
[
  {{
    "Test_ID": "TC-001",
    "Feature": "Discount Code",
    "Test_Scenario": "Apply the valid discount code 'SAVE15'.",
    "Expected_Result": "The total price is reduced by 15%.",
    "Grounded_In": ["product_specs.md"]
  }},
  {{
    "Test_ID": "TC-002",
    "Feature": "Form Validation",
    "Test_Scenario": "Submit the user details form with an invalid email address.",
    "Expected_Result": "The error message 'Invalid email format' is shown in red.",
    "Grounded_In": ["ui_ux_guide.txt", "product_specs.md"]
  }}
]
"#,
        sources = sources.join(", "),
        context = context.joined_context(),
        query = query,
    )
}

fn script_prompt(test_case: &TestCase, page: &str, markup: &str, context: &RetrievalResult) -> String {
    format!(
        r#"You are an expert Python Selenium developer. Write a complete, executable Python script that automates the test case below.
Every selector must match an element that exists in this HTML ({page}):
<html_structure>
{markup}
</html_structure>

Documentation that may be relevant:
<context>
{context}
</context>

Test case {test_id} ({feature}):
Test Scenario: {scenario}
Expected Result: {expected}

The script must:
1. Start a WebDriver (Chrome).
2. Open the page; assume {page} is served locally or load it with a file:// URL.
3. Carry out the scenario's steps using selectors taken from the HTML above.
4. Use WebDriverWait where an element may appear dynamically.
5. Check the expected result and print a success message when it holds.
6. Quit the driver when done.
7. Use standard imports (from selenium import webdriver, from selenium.webdriver.common.by import By).

Output only the Python code, with valid syntax and nothing else.
"#,
        page = page,
        markup = markup,
        context = context.joined_context(),
        test_id = test_case.test_id,
        feature = test_case.feature,
        scenario = test_case.test_scenario,
        expected = test_case.expected_result,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retrieval() -> RetrievalResult {
        RetrievalResult {
            chunks: vec!["SAVE15 gives 15% off.".into(), "Errors are shown in red.".into()],
            sources: vec!["specs.md".into(), "ui.txt".into()],
        }
    }

    fn case() -> TestCase {
        TestCase {
            test_id: "TC-001".into(),
            feature: "Discount".into(),
            test_scenario: "Apply SAVE15".into(),
            expected_result: "Price reduced 15%".into(),
            grounded_in: vec!["specs.md".into()],
        }
    }

    #[test]
    fn test_case_prompt_carries_context_sources_and_query() {
        let r = retrieval();
        let prompt = test_case_prompt("discount codes", &r, &r.unique_sources());
        assert!(prompt.contains("from documents: specs.md, ui.txt"));
        assert!(prompt.contains("SAVE15 gives 15% off.\n\nErrors are shown in red."));
        assert!(prompt.contains(r#"User request: "discount codes""#));
        assert!(prompt.contains(r#""Grounded_In": ["product_specs.md"]"#));
    }

    #[test]
    fn script_prompt_embeds_markup_and_case() {
        let prompt = script_prompt(&case(), "checkout.html", "<button id=\"pay\">Pay</button>", &retrieval());
        assert!(prompt.contains("<button id=\"pay\">Pay</button>"));
        assert!(prompt.contains("Test Scenario: Apply SAVE15"));
        assert!(prompt.contains("Expected Result: Price reduced 15%"));
        assert!(prompt.contains("assume checkout.html is served locally"));
    }
}
