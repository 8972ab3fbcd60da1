//! Deterministic identifier derivation.
//!
//! Every entity the pipeline mints gets a uuid5 under a fixed namespace so
//! replays and independently-running chunks converge on the same keys
//! without any coordination. The key is the pipe-joined, lowercased,
//! whitespace-stripped canonical tuple for the entity family.

use uuid::Uuid;

pub const NAMESPACE_SALES: Uuid = Uuid::from_u128(0x1b671a64_40d5_491e_99b0_da01ff1f3341);
pub const NAMESPACE_LINE_ITEM: Uuid = Uuid::from_u128(0x2c4e0d2a_8f13_4a6e_b1c7_5d1f0a9e6b23);
pub const NAMESPACE_ADDRESS: Uuid = Uuid::from_u128(0x3f8e1b7c_2a94_4d05_9e61_7b3c4d5e6f70);
pub const NAMESPACE_ATTRIBUTE: Uuid = Uuid::from_u128(0x4a0b9c8d_7e6f_4321_8abc_def012345678);

/// Join key parts with `|`, lowercase, and strip all whitespace.
fn canonical_key(parts: &[&str]) -> String {
    let joined = parts.join("|");
    joined
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn derive(ns: &Uuid, parts: &[&str]) -> Uuid {
    Uuid::new_v5(ns, canonical_key(parts).as_bytes())
}

/// The sales_batch entity reuses the caller's upload_id verbatim.
pub fn sales_batch_id(upload_id: Uuid) -> Uuid {
    upload_id
}

pub fn transaction_id(upload_id: Uuid, order_key: &str) -> Uuid {
    derive(&NAMESPACE_SALES, &[&upload_id.to_string(), order_key])
}

/// Line-item identity covers the whole staging row so two identical rows in
/// the same order still collapse to one line item on replay.
pub fn line_item_id(upload_id: Uuid, order_key: &str, row_json: &str) -> Uuid {
    derive(
        &NAMESPACE_LINE_ITEM,
        &[&upload_id.to_string(), order_key, row_json],
    )
}

pub fn address_id(
    delivery_line_1: &str,
    delivery_line_2: &str,
    city_name: &str,
    state_abbreviation: &str,
    zipcode: &str,
) -> Uuid {
    derive(
        &NAMESPACE_ADDRESS,
        &[
            delivery_line_1,
            delivery_line_2,
            city_name,
            state_abbreviation,
            zipcode,
        ],
    )
}

pub fn attribute_id(entity_type: &str, name: &str, data_type: &str) -> Uuid {
    derive(&NAMESPACE_ATTRIBUTE, &[entity_type, name, data_type])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_key_lowercases_and_strips_whitespace() {
        assert_eq!(
            canonical_key(&["123 Main St", "Spring Field", "IL"]),
            "123mainst|springfield|il"
        );
    }

    #[test]
    fn derivation_is_deterministic() {
        let upload = Uuid::new_v4();
        assert_eq!(
            transaction_id(upload, "ORD-1"),
            transaction_id(upload, "ORD-1")
        );
        assert_eq!(
            address_id("123 Main St", "", "Springfield", "IL", "62704"),
            address_id("123 MAIN ST", "", "springfield", "il", "62704"),
        );
    }

    #[test]
    fn distinct_keys_produce_distinct_ids() {
        let upload = Uuid::new_v4();
        assert_ne!(
            transaction_id(upload, "ORD-1"),
            transaction_id(upload, "ORD-2")
        );
        assert_ne!(
            transaction_id(upload, "ORD-1"),
            line_item_id(upload, "ORD-1", "{}")
        );
    }

    #[test]
    fn namespaces_are_disjoint() {
        let all = [
            NAMESPACE_SALES,
            NAMESPACE_LINE_ITEM,
            NAMESPACE_ADDRESS,
            NAMESPACE_ATTRIBUTE,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
