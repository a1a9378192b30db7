use meridiandb_schema::{ids, stdlib, SchemaView};
use meridiandb_wire::descriptor::{
    describe, parse, DescribeOptions, TypeExpr, ViewShapeMetadata, ViewShapes,
};
use meridiandb_wire::ProtocolVersion;
use proptest::prelude::*;

fn schema_view() -> SchemaView {
    SchemaView::new(
        stdlib::std_schema().clone(),
        Default::default(),
        Default::default(),
    )
}

fn scalar_ids() -> Vec<uuid::Uuid> {
    vec![
        ids::UUID_TYPE_ID,
        ids::STR_TYPE_ID,
        ids::BYTES_TYPE_ID,
        ids::INT64_TYPE_ID,
        ids::FLOAT64_TYPE_ID,
        ids::BOOL_TYPE_ID,
        ids::JSON_TYPE_ID,
    ]
}

fn type_expr() -> impl Strategy<Value = TypeExpr> {
    let leaf = prop::sample::select(scalar_ids()).prop_map(TypeExpr::Scalar);
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(TypeExpr::Tuple),
            prop::collection::vec(("[a-d]{1,6}", inner.clone()), 1..4).prop_map(|els| {
                let mut seen = std::collections::HashSet::new();
                let els = els
                    .into_iter()
                    .enumerate()
                    .map(|(i, (mut n, t))| {
                        if !seen.insert(n.clone()) {
                            n = format!("{n}_{i}");
                            seen.insert(n.clone());
                        }
                        (n.into_boxed_str(), t)
                    })
                    .collect();
                TypeExpr::NamedTuple(els)
            }),
            inner.clone().prop_map(|t| TypeExpr::Array(Box::new(t))),
            inner.prop_map(|t| TypeExpr::Range(Box::new(t))),
        ]
    })
}

proptest! {
    #[test]
    fn parse_recovers_the_type_id(ty in type_expr()) {
        let view = schema_view();
        let (bytes, tid) = describe(
            &view,
            &ty,
            &ViewShapes::default(),
            &ViewShapeMetadata::default(),
            DescribeOptions::default(),
        )
        .unwrap();
        let parsed = parse(&bytes, ProtocolVersion::CURRENT).unwrap();
        prop_assert_eq!(parsed.type_id(), tid);
    }

    #[test]
    fn two_builders_agree_bytewise(ty in type_expr()) {
        let view = schema_view();
        let a = describe(
            &view,
            &ty,
            &ViewShapes::default(),
            &ViewShapeMetadata::default(),
            DescribeOptions::default(),
        )
        .unwrap();
        let b = describe(
            &view,
            &ty,
            &ViewShapes::default(),
            &ViewShapeMetadata::default(),
            DescribeOptions::default(),
        )
        .unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn equal_structures_share_ids(els in prop::collection::vec(
        prop::sample::select(scalar_ids()).prop_map(TypeExpr::Scalar), 0..4,
    )) {
        let view = schema_view();
        let a = TypeExpr::Tuple(els.clone());
        let b = TypeExpr::Tuple(els);
        let (_, tid_a) = describe(
            &view, &a, &ViewShapes::default(), &ViewShapeMetadata::default(),
            DescribeOptions::default(),
        ).unwrap();
        let (_, tid_b) = describe(
            &view, &b, &ViewShapes::default(), &ViewShapeMetadata::default(),
            DescribeOptions::default(),
        ).unwrap();
        prop_assert_eq!(tid_a, tid_b);
    }
}
