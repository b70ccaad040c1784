//! Entity catalog: measurement channel definitions, registered once at
//! startup from every adapter's `provided_entities()` and never mutated
//! thereafter (spec.md §9 "global state").

use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    Mean,
    Max,
    Min,
    Sum,
    Last,
    None,
}

impl AggregationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMethod::Mean => "mean",
            AggregationMethod::Max => "max",
            AggregationMethod::Min => "min",
            AggregationMethod::Sum => "sum",
            AggregationMethod::Last => "last",
            AggregationMethod::None => "none",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "mean" => Some(AggregationMethod::Mean),
            "max" => Some(AggregationMethod::Max),
            "min" => Some(AggregationMethod::Min),
            "sum" => Some(AggregationMethod::Sum),
            "last" => Some(AggregationMethod::Last),
            "none" => Some(AggregationMethod::None),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
    pub entity_id: String,
    pub friendly_name: String,
    pub source: String,
    pub unit: String,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub aggregation_method: AggregationMethod,
}

/// Immutable catalog of every entity provided by every adapter at startup.
#[derive(Clone, Debug, Default)]
pub struct EntityRegistry {
    entities: HashMap<String, Entity>,
}

impl EntityRegistry {
    pub fn build(catalogs: impl IntoIterator<Item = Vec<Entity>>) -> Self {
        let mut entities = HashMap::new();
        for catalog in catalogs {
            for entity in catalog {
                entities.insert(entity.entity_id.clone(), entity);
            }
        }
        Self { entities }
    }

    pub fn get(&self, entity_id: &str) -> Option<&Entity> {
        self.entities.get(entity_id)
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entities.contains_key(entity_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entity(id: &str) -> Entity {
        Entity {
            entity_id: id.to_string(),
            friendly_name: id.to_string(),
            source: "davis-serial".to_string(),
            unit: "C".to_string(),
            device_class: None,
            state_class: None,
            aggregation_method: AggregationMethod::Mean,
        }
    }

    #[test]
    fn build_merges_catalogs_and_dedupes_by_id() {
        let registry = EntityRegistry::build([
            vec![sample_entity("sensor.davis_temp_out")],
            vec![sample_entity("sensor.davis_temp_out"), sample_entity("sensor.davis_humidity_out")],
        ]);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("sensor.davis_temp_out"));
        assert!(registry.contains("sensor.davis_humidity_out"));
        assert!(!registry.contains("sensor.unknown"));
    }

    #[test]
    fn aggregation_method_round_trips_through_str() {
        for method in [
            AggregationMethod::Mean,
            AggregationMethod::Max,
            AggregationMethod::Min,
            AggregationMethod::Sum,
            AggregationMethod::Last,
            AggregationMethod::None,
        ] {
            assert_eq!(AggregationMethod::from_str(method.as_str()), Some(method));
        }
    }
}
