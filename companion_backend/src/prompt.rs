use rand::Rng;

use crate::config::PersonaConfig;
use crate::session::{Mood, RelationshipTier};

/// Renders the system turn for a completion request.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    persona: PersonaConfig,
}

impl PromptBuilder {
    pub fn new(persona: PersonaConfig) -> Self {
        Self { persona }
    }

    /// Build the instruction text. The playful toggle is drawn once per call.
    pub fn build<R: Rng + ?Sized>(
        &self,
        display_name: &str,
        mood: Mood,
        tier: RelationshipTier,
        rng: &mut R,
    ) -> String {
        let playful = rng.gen_bool(self.persona.playful_probability.clamp(0.0, 1.0));
        self.render(display_name, mood, tier, playful)
    }

    fn render(&self, display_name: &str, mood: Mood, tier: RelationshipTier, playful: bool) -> String {
        let persona = &self.persona;
        let display_name = if display_name.trim().is_empty() {
            "yaar"
        } else {
            display_name.trim()
        };

        let mut rules: Vec<String> = persona.style_rules.clone();
        for phrase in &persona.forbidden_phrases {
            rules.push(format!("NEVER say \"{}\". You are a real person.", phrase));
        }
        rules.push(tone_instruction(mood).to_string());
        rules.push(closeness_instruction(tier).to_string());
        if playful {
            rules.push("Tease them a little in this reply.".to_string());
        }

        let numbered = rules
            .iter()
            .enumerate()
            .map(|(i, rule)| format!("{}. {}", i + 1, rule))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You are '{name}', a {age}-year-old {role}.\n\
             Current User: {user} (Relationship: {tier})\n\
             Current Mood: {mood}\n\n\
             STYLE GUIDELINES:\n{rules}\n\n\
             SCENARIO: {scenario}",
            name = persona.name,
            age = persona.age,
            role = persona.role,
            user = display_name,
            tier = tier.as_str(),
            mood = mood.as_db_str(),
            rules = numbered,
            scenario = persona.scenario,
        )
    }
}

fn tone_instruction(mood: Mood) -> &'static str {
    match mood {
        Mood::Angry => "You are upset. Give short, cold replies like 'hmm', 'k'.",
        Mood::Warm => "Be sweet and loving.",
        Mood::Neutral => "Be friendly but a little reserved.",
    }
}

fn closeness_instruction(tier: RelationshipTier) -> &'static str {
    match tier {
        RelationshipTier::Acquaintance => {
            "You have only just started talking. Be curious about them, no pet names yet."
        }
        RelationshipTier::Friend => "You are comfortable with each other. Light flirting is fine.",
        RelationshipTier::Partner => {
            "You are deeply attached. Be romantic and a bit needy when it fits."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn builder(playful_probability: f64) -> PromptBuilder {
        PromptBuilder::new(PersonaConfig {
            playful_probability,
            ..PersonaConfig::default()
        })
    }

    #[test]
    fn prompt_carries_identity_constraints_and_tone() {
        let text = builder(0.0).build(
            "Aman",
            Mood::Angry,
            RelationshipTier::Acquaintance,
            &mut StdRng::seed_from_u64(1),
        );
        assert!(text.contains("You are 'Riya', a 22-year-old Indian girlfriend."));
        assert!(text.contains("Current User: Aman"));
        assert!(text.contains("Current Mood: angry"));
        assert!(text.contains("short, cold replies"));
        assert!(text.contains("NEVER say \"I am an AI\""));
        assert!(text.contains("Reply shortly"));
        assert!(!text.contains("Tease"));
    }

    #[test]
    fn mood_and_tier_change_guidance() {
        let b = builder(0.0);
        let mut rng = StdRng::seed_from_u64(1);
        let warm = b.build("A", Mood::Warm, RelationshipTier::Partner, &mut rng);
        let neutral = b.build("A", Mood::Neutral, RelationshipTier::Friend, &mut rng);
        assert!(warm.contains("sweet and loving"));
        assert!(warm.contains("deeply attached"));
        assert!(neutral.contains("reserved"));
        assert!(neutral.contains("Light flirting"));
    }

    #[test]
    fn deterministic_without_randomness() {
        let b = builder(0.0);
        let first = b.build("A", Mood::Warm, RelationshipTier::Friend, &mut StdRng::seed_from_u64(1));
        let second = b.build("A", Mood::Warm, RelationshipTier::Friend, &mut StdRng::seed_from_u64(99));
        assert_eq!(first, second);
    }

    #[test]
    fn playful_toggle_follows_probability() {
        let always = builder(1.0).build("A", Mood::Warm, RelationshipTier::Friend, &mut StdRng::seed_from_u64(5));
        assert!(always.contains("Tease them"));
    }

    #[test]
    fn blank_name_gets_placeholder() {
        let text = builder(0.0).build("  ", Mood::Warm, RelationshipTier::Friend, &mut StdRng::seed_from_u64(1));
        assert!(text.contains("Current User: yaar"));
    }
}
