use crate::param::CharPool;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;

/// One node of a test-case input tree. A closed set of variants rather than a
/// type hierarchy: mutation and impact tracking dispatch by pattern match and
/// stay exhaustive.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub enum Gene {
    Boolean {
        value: bool,
    },
    Integer {
        value: i64,
        min: i64,
        max: i64,
    },
    Double {
        value: f64,
        min: f64,
        max: f64,
    },
    Text {
        value: String,
        min_len: usize,
        max_len: usize,
    },
    Enumeration {
        index: usize,
        variants: Vec<String>,
    },
    Object {
        fields: Vec<(String, Gene)>,
    },
    Array {
        elements: Vec<Gene>,
        template: Box<Gene>,
        min_size: usize,
        max_size: usize,
    },
}

/// Lowest code point of the mutation alphabet
pub fn char_min(pool: &CharPool) -> u32 {
    match pool {
        CharPool::Word => '0' as u32,
        CharPool::All => ' ' as u32,
    }
}

/// Highest code point of the mutation alphabet
pub fn char_max(pool: &CharPool) -> u32 {
    match pool {
        CharPool::Word => 'z' as u32,
        CharPool::All => '~' as u32,
    }
}

pub fn random_char(pool: &CharPool, rng: &mut ChaCha8Rng) -> char {
    let code = rng.gen_range(char_min(pool)..=char_max(pool));
    char::from_u32(code).unwrap_or('_')
}

impl Gene {
    pub fn kind(&self) -> &'static str {
        match self {
            Gene::Boolean { .. } => "boolean",
            Gene::Integer { .. } => "integer",
            Gene::Double { .. } => "double",
            Gene::Text { .. } => "text",
            Gene::Enumeration { .. } => "enumeration",
            Gene::Object { .. } => "object",
            Gene::Array { .. } => "array",
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Gene::Object { .. } | Gene::Array { .. })
    }

    pub fn child_count(&self) -> usize {
        match self {
            Gene::Object { fields } => fields.len(),
            Gene::Array { elements, .. } => elements.len(),
            _ => 0,
        }
    }

    pub fn child(&self, i: usize) -> Option<&Gene> {
        match self {
            Gene::Object { fields } => fields.get(i).map(|(_, g)| g),
            Gene::Array { elements, .. } => elements.get(i),
            _ => None,
        }
    }

    pub fn child_mut(&mut self, i: usize) -> Option<&mut Gene> {
        match self {
            Gene::Object { fields } => fields.get_mut(i).map(|(_, g)| g),
            Gene::Array { elements, .. } => elements.get_mut(i),
            _ => None,
        }
    }

    /// Follow a path of child indices down the tree
    pub fn descend_mut(&mut self, path: &[usize]) -> Option<&mut Gene> {
        let mut gene = self;
        for &i in path {
            gene = gene.child_mut(i)?;
        }
        Some(gene)
    }

    pub fn descend(&self, path: &[usize]) -> Option<&Gene> {
        let mut gene = self;
        for &i in path {
            gene = gene.child(i)?;
        }
        Some(gene)
    }

    /// Draw a fresh value for this gene and all its children
    pub fn randomize(&mut self, pool: &CharPool, rng: &mut ChaCha8Rng) {
        match self {
            Gene::Boolean { value } => *value = rng.gen_bool(0.5),
            Gene::Integer { value, min, max } => *value = rng.gen_range(*min..=*max),
            Gene::Double { value, min, max } => *value = rng.gen_range(*min..=*max),
            Gene::Text { value, min_len, max_len } => {
                let len = rng.gen_range(*min_len..=*max_len);
                *value = (0..len).map(|_| random_char(pool, rng)).collect();
            }
            Gene::Enumeration { index, variants } => {
                if !variants.is_empty() {
                    *index = rng.gen_range(0..variants.len());
                }
            }
            Gene::Object { fields } => {
                for (_, g) in fields.iter_mut() {
                    g.randomize(pool, rng);
                }
            }
            Gene::Array { elements, template, min_size, max_size } => {
                let size = rng.gen_range(*min_size..=*max_size);
                elements.clear();
                for _ in 0..size {
                    let mut g = (**template).clone();
                    g.randomize(pool, rng);
                    elements.push(g);
                }
            }
        }
    }

    /// Stable structural hash contribution, used for individual identity
    pub fn feed_hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Gene::Boolean { value } => {
                state.write_u8(0);
                state.write_u8(*value as u8);
            }
            Gene::Integer { value, .. } => {
                state.write_u8(1);
                state.write_i64(*value);
            }
            Gene::Double { value, .. } => {
                state.write_u8(2);
                state.write_u64(value.to_bits());
            }
            Gene::Text { value, .. } => {
                state.write_u8(3);
                state.write(value.as_bytes());
            }
            Gene::Enumeration { index, .. } => {
                state.write_u8(4);
                state.write_usize(*index);
            }
            Gene::Object { fields } => {
                state.write_u8(5);
                for (name, g) in fields {
                    state.write(name.as_bytes());
                    g.feed_hash(state);
                }
            }
            Gene::Array { elements, .. } => {
                state.write_u8(6);
                state.write_usize(elements.len());
                for g in elements {
                    g.feed_hash(state);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::collections::hash_map::DefaultHasher;

    fn sample_object() -> Gene {
        Gene::Object {
            fields: vec![
                ("flag".to_string(), Gene::Boolean { value: false }),
                ("count".to_string(), Gene::Integer { value: 0, min: 0, max: 100 }),
            ],
        }
    }

    #[test]
    fn test_randomize_respects_ranges() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..50 {
            let mut g = Gene::Integer { value: 0, min: -5, max: 5 };
            g.randomize(&CharPool::Word, &mut rng);
            if let Gene::Integer { value, .. } = g {
                assert!((-5..=5).contains(&value));
            }

            let mut t = Gene::Text { value: String::new(), min_len: 2, max_len: 6 };
            t.randomize(&CharPool::Word, &mut rng);
            if let Gene::Text { value, .. } = t {
                assert!((2..=6).contains(&value.chars().count()));
            }
        }
    }

    #[test]
    fn test_randomize_array_rebuilds_from_template() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut g = Gene::Array {
            elements: vec![],
            template: Box::new(Gene::Integer { value: 0, min: 0, max: 9 }),
            min_size: 1,
            max_size: 4,
        };
        g.randomize(&CharPool::Word, &mut rng);
        assert!((1..=4).contains(&g.child_count()));
        for i in 0..g.child_count() {
            assert_eq!(g.child(i).unwrap().kind(), "integer");
        }
    }

    #[test]
    fn test_descend_paths() {
        let mut g = Gene::Object {
            fields: vec![("inner".to_string(), sample_object())],
        };
        assert_eq!(g.descend(&[0, 1]).unwrap().kind(), "integer");
        assert!(g.descend(&[0, 5]).is_none());
        if let Some(Gene::Boolean { value }) = g.descend_mut(&[0, 0]) {
            *value = true;
        }
        assert_eq!(g.descend(&[0, 0]), Some(&Gene::Boolean { value: true }));
    }

    #[test]
    fn test_hash_differs_on_value_change() {
        let a = sample_object();
        let mut b = sample_object();
        if let Some(Gene::Integer { value, .. }) = b.descend_mut(&[1]) {
            *value = 7;
        }
        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.feed_hash(&mut ha);
        b.feed_hash(&mut hb);
        assert_ne!(ha.finish(), hb.finish());
    }

    #[test]
    fn test_char_pool_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..100 {
            let c = random_char(&CharPool::Word, &mut rng) as u32;
            assert!(c >= char_min(&CharPool::Word) && c <= char_max(&CharPool::Word));
        }
    }
}
