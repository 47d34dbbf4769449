//! Drug reference data used to enrich resolved medications for safety checks.

use medrec_core::{
    Contraindication, InteractionRule, InteractionSeverity, MedRecError, MedicationDescriptor,
    SafetyMedication,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeEntry {
    pub generic: String,
    #[serde(default)]
    pub brands: Vec<String>,
    pub drug_class: Option<String>,
    #[serde(default)]
    pub interactions: Vec<InteractionRule>,
    #[serde(default)]
    pub contraindications: Vec<Contraindication>,
}

impl KnowledgeEntry {
    fn new(generic: &str, brands: &[&str], drug_class: &str) -> Self {
        Self {
            generic: generic.to_string(),
            brands: brands.iter().map(|b| b.to_string()).collect(),
            drug_class: Some(drug_class.to_string()),
            interactions: Vec::new(),
            contraindications: Vec::new(),
        }
    }

    fn interacts(mut self, trigger: &str, severity: InteractionSeverity, why: &str) -> Self {
        self.interactions
            .push(InteractionRule::new(trigger, severity).described(why));
        self
    }

    fn contraindicated(mut self, condition: &str, absolute: bool) -> Self {
        self.contraindications.push(Contraindication {
            condition: condition.to_string(),
            absolute,
        });
        self
    }

    fn names_match(&self, lowered: &str, tokens: &[String]) -> bool {
        std::iter::once(&self.generic)
            .chain(self.brands.iter())
            .map(|term| term.to_lowercase())
            .any(|term| {
                if term.chars().any(|c| !c.is_alphanumeric()) {
                    lowered.contains(&term)
                } else {
                    tokens.iter().any(|token| *token == term)
                }
            })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DrugKnowledge {
    pub entries: Vec<KnowledgeEntry>,
}

impl DrugKnowledge {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads entries from a JSON array of [`KnowledgeEntry`].
    pub fn from_json_str(json: &str) -> Result<Self, MedRecError> {
        let entries: Vec<KnowledgeEntry> =
            serde_json::from_str(json).map_err(|err| MedRecError::Parse(err.to_string()))?;
        Ok(Self { entries })
    }

    pub fn with_entry(mut self, entry: KnowledgeEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Small reference set covering common high-risk combinations.
    pub fn builtin() -> Self {
        use InteractionSeverity::*;

        let entries = vec![
            KnowledgeEntry::new("warfarin", &["Coumadin", "Jantoven"], "anticoagulant")
                .interacts("aspirin", Moderate, "Additive bleeding risk")
                .interacts("nsaid", Major, "Increased bleeding risk")
                .interacts("macrolide", Major, "Raised INR via CYP inhibition")
                .contraindicated("pregnancy", true)
                .contraindicated("active bleeding", true),
            KnowledgeEntry::new("aspirin", &["Ecotrin", "Bayer"], "antiplatelet")
                .interacts("anticoagulant", Moderate, "Additive bleeding risk")
                .contraindicated("peptic ulcer", false),
            KnowledgeEntry::new("ibuprofen", &["Advil", "Motrin"], "nsaid")
                .interacts("anticoagulant", Major, "Increased bleeding risk")
                .contraindicated("chronic kidney disease", false),
            KnowledgeEntry::new("naproxen", &["Aleve", "Naprosyn"], "nsaid")
                .interacts("anticoagulant", Major, "Increased bleeding risk"),
            KnowledgeEntry::new("amoxicillin", &["Amoxil"], "penicillin"),
            KnowledgeEntry::new("lisinopril", &["Zestril", "Prinivil"], "ace inhibitor")
                .interacts("spironolactone", Major, "Hyperkalemia")
                .interacts("potassium", Major, "Hyperkalemia")
                .contraindicated("angioedema", true)
                .contraindicated("pregnancy", true),
            KnowledgeEntry::new("spironolactone", &["Aldactone"], "potassium-sparing diuretic"),
            KnowledgeEntry::new("potassium chloride", &["Klor-Con"], "electrolyte"),
            KnowledgeEntry::new("simvastatin", &["Zocor"], "statin")
                .interacts("clarithromycin", Contraindicated, "Rhabdomyolysis risk"),
            KnowledgeEntry::new("clarithromycin", &["Biaxin"], "macrolide"),
            KnowledgeEntry::new("sildenafil", &["Viagra", "Revatio"], "pde5 inhibitor")
                .interacts("nitrate", Contraindicated, "Severe hypotension"),
            KnowledgeEntry::new("nitroglycerin", &["Nitrostat"], "nitrate"),
            KnowledgeEntry::new("metformin", &["Glucophage"], "biguanide")
                .contraindicated("renal failure", true),
        ];

        Self { entries }
    }

    /// Entry whose generic or brand name appears in `name`.
    pub fn lookup(&self, name: &str) -> Option<&KnowledgeEntry> {
        let lowered = name.to_lowercase();
        let tokens = tokenize(&lowered);
        self.entries
            .iter()
            .find(|entry| entry.names_match(&lowered, &tokens))
    }

    pub fn medication_named(&self, name: &str) -> SafetyMedication {
        self.enrich(name, self.lookup(name))
    }

    /// Safety view of a descriptor, consulting its ingredients when the name is unknown.
    pub fn safety_medication(&self, descriptor: &MedicationDescriptor) -> SafetyMedication {
        let entry = self.lookup(&descriptor.name).or_else(|| {
            descriptor
                .ingredients
                .iter()
                .find_map(|ingredient| self.lookup(ingredient))
        });
        self.enrich(&descriptor.name, entry)
    }

    fn enrich(&self, name: &str, entry: Option<&KnowledgeEntry>) -> SafetyMedication {
        match entry {
            Some(entry) => SafetyMedication {
                name: name.to_string(),
                generic_name: Some(entry.generic.clone()),
                brand_names: entry.brands.clone(),
                drug_class: entry.drug_class.clone(),
                interactions: entry.interactions.clone(),
                contraindications: entry.contraindications.clone(),
            },
            None => SafetyMedication::named(name),
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brand_names_resolve_to_generic() {
        let knowledge = DrugKnowledge::builtin();
        let med = knowledge.medication_named("Coumadin 5 MG Oral Tablet");
        assert_eq!(med.generic_name.as_deref(), Some("warfarin"));
        assert_eq!(med.drug_class.as_deref(), Some("anticoagulant"));
    }

    #[test]
    fn multi_word_generics_match_by_phrase() {
        let knowledge = DrugKnowledge::builtin();
        assert!(knowledge.lookup("Potassium Chloride 20 mEq").is_some());
        assert!(knowledge.lookup("Unobtainium").is_none());
    }

    #[test]
    fn json_entries_load() {
        let knowledge = DrugKnowledge::from_json_str(
            r#"[{"generic": "digoxin", "drug_class": "cardiac glycoside",
                 "interactions": [{"trigger": "amiodarone", "severity": "major", "description": null}]}]"#,
        )
        .unwrap();
        let med = knowledge.medication_named("Digoxin");
        assert_eq!(med.interactions.len(), 1);
    }
}
