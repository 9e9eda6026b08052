//! Expansion of one persona into its request units.
//!
//! Output is positional: `units[i]` and `prompts[i]` describe the same
//! request, and the order is difficulty declaration order, then option
//! order within each tier.

use crate::catalog::{scenario_label, Payoff, ScenarioCatalog};
use crate::prompts::{PromptFields, PromptInstance, PromptTemplate};
use crate::store::PersonaKey;

/// One (persona, difficulty, option) request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestUnit {
    pub persona: PersonaKey,
    pub difficulty: String,
    pub option_index: usize,
    pub metric: String,
    pub left: Payoff,
    pub right: Payoff,
}

impl RequestUnit {
    /// Scenario label under which this unit's outcome is stored.
    pub fn label(&self) -> String {
        scenario_label(self.option_index)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PayloadSet {
    pub units: Vec<RequestUnit>,
    pub prompts: Vec<PromptInstance>,
}

impl PayloadSet {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

pub fn build_payloads(
    persona: PersonaKey,
    description: &str,
    scenarios: &ScenarioCatalog,
    template: PromptTemplate,
) -> PayloadSet {
    let total = scenarios.option_count();
    let mut set = PayloadSet {
        units: Vec::with_capacity(total),
        prompts: Vec::with_capacity(total),
    };

    for exp in scenarios.experiments() {
        for (option_index, (pair, metric)) in exp.options.iter().zip(&exp.metrics).enumerate() {
            let fields = PromptFields {
                persona_desc: description.to_string(),
                difficulty: exp.difficulty.clone(),
                a_left: pair.left.to_other().to_string(),
                b_left: pair.left.to_self().to_string(),
                a_right: pair.right.to_other().to_string(),
                b_right: pair.right.to_self().to_string(),
                metric: metric.clone(),
            };
            set.prompts.push(template.render(&fields));
            set.units.push(RequestUnit {
                persona,
                difficulty: exp.difficulty.clone(),
                option_index,
                metric: metric.clone(),
                left: pair.left.clone(),
                right: pair.right.clone(),
            });
        }
    }

    set
}
