//! Property tests for the diff engine and its pairing with the simulator.

use oxide_evolution::prelude::*;
use proptest::prelude::*;

fn arb_model(name: &'static str) -> impl Strategy<Value = ModelSignature> {
    (
        prop::option::of((prop::sample::select(vec![100i64, 200]), any::<bool>())),
        prop::option::of(any::<bool>()),
        prop::option::of((any::<bool>(), any::<bool>(), prop::option::of(0i64..3))),
        prop::option::of(prop::option::of(any::<bool>())),
        any::<bool>(),
    )
        .prop_map(move |(title, body, views, published, constrained)| {
            let mut model = ModelSignature::new(name)
                .field(FieldSignature::new("id", FieldType::Auto).primary_key());
            if let Some((length, null)) = title {
                model = model.field(
                    FieldSignature::new("title", FieldType::Char)
                        .max_length(length)
                        .null(null),
                );
            }
            if let Some(null) = body {
                model = model.field(FieldSignature::new("body", FieldType::Text).null(null));
            }
            if let Some((null, indexed, default)) = views {
                let mut field = FieldSignature::new("views", FieldType::Integer)
                    .null(null)
                    .db_index(indexed);
                if let Some(default) = default {
                    field = field.default_value(default);
                }
                model = model.field(field);
            }
            if let Some(default) = published {
                let mut field = FieldSignature::new("published", FieldType::Boolean);
                if let Some(default) = default {
                    field = field.default_value(default);
                }
                model = model.field(field);
            }
            if constrained && title.is_some() {
                model = model.unique_together(&["id", "title"]);
            }
            if constrained && views.is_some() {
                model = model.index(IndexSignature::new(vec!["views".into()]));
            }
            model
        })
}

fn arb_app(name: &'static str) -> impl Strategy<Value = ApplicationSignature> {
    (
        arb_model("Post"),
        prop::option::of(arb_model("Comment")),
        prop::option::of(arb_model("Tag")),
    )
        .prop_map(move |(post, comment, tag)| {
            [Some(post), comment, tag]
                .into_iter()
                .flatten()
                .fold(ApplicationSignature::new(name), ApplicationSignature::model)
        })
}

/// Relations within one application. `Comment.post` and `Post.pinned`
/// together form a reference cycle.
#[derive(Debug, Clone)]
struct Relations {
    comment_post: Option<bool>,
    post_pinned: Option<bool>,
    post_tags: bool,
}

fn arb_relations() -> impl Strategy<Value = Relations> {
    (
        prop::option::of(any::<bool>()),
        prop::option::of(any::<bool>()),
        any::<bool>(),
    )
        .prop_map(|(comment_post, post_pinned, post_tags)| Relations {
            comment_post,
            post_pinned,
            post_tags,
        })
}

/// Adds `field` to `app.model` when both the model and the relation target
/// exist.
fn relate(project: &mut ProjectSignature, app: &str, model: &str, field: FieldSignature) {
    let target_exists = field.related().is_some_and(|target| project.resolve(target).is_some());
    if !target_exists {
        return;
    }
    if let Some(owner) = project.get_model_mut(app, model) {
        owner.fields.insert(field.name.clone(), field);
    }
}

fn foreign_key(name: &str, target: &str, null: bool) -> FieldSignature {
    FieldSignature::new(name, FieldType::ForeignKey)
        .related_model(target)
        .null(null)
}

fn add_relations(project: &mut ProjectSignature, app: &str, relations: &Relations) {
    if let Some(null) = relations.comment_post {
        relate(project, app, "Comment", foreign_key("post", &format!("{app}.Post"), null));
    }
    if let Some(together) = relations.post_pinned {
        relate(project, app, "Post", foreign_key("pinned", &format!("{app}.Comment"), true));
        if let Some(post) = project.get_model_mut(app, "Post") {
            if together && post.fields.contains_key("pinned") {
                *post = post.clone().unique_together(&["id", "pinned"]);
            }
        }
    }
    if relations.post_tags {
        relate(
            project,
            app,
            "Post",
            FieldSignature::new("tags", FieldType::ManyToMany).related_model(format!("{app}.Tag")),
        );
    }
}

fn arb_project() -> impl Strategy<Value = ProjectSignature> {
    (
        prop::option::of((arb_app("blog"), arb_relations())),
        prop::option::of((arb_app("shop"), arb_relations())),
        prop::option::of(any::<bool>()),
        prop::option::of(any::<bool>()),
    )
        .prop_map(|(blog, shop, buyer, origin)| {
            let mut project = ProjectSignature::new();
            let mut relations = Vec::new();
            for (app, app_relations) in [blog, shop].into_iter().flatten() {
                relations.push((app.name.clone(), app_relations));
                project = project.app(app);
            }
            for (app, app_relations) in &relations {
                add_relations(&mut project, app, app_relations);
            }
            // Together these two relations make the applications depend on
            // each other.
            if let Some(null) = buyer {
                relate(&mut project, "blog", "Post", foreign_key("buyer", "shop.Post", null));
            }
            if let Some(null) = origin {
                relate(&mut project, "shop", "Tag", foreign_key("origin", "blog.Tag", null));
            }
            project
        })
}

fn is_deletion(mutation: &MutationSpec) -> bool {
    matches!(
        mutation,
        MutationSpec::DeleteApplication { .. }
            | MutationSpec::DeleteModel { .. }
            | MutationSpec::DeleteField { .. }
            | MutationSpec::DeleteRelation { .. }
    )
}

fn is_addition(mutation: &MutationSpec) -> bool {
    matches!(
        mutation,
        MutationSpec::AddModel { .. } | MutationSpec::AddField { .. } | MutationSpec::AddRelation { .. }
    )
}

proptest! {
    #[test]
    fn diff_of_identical_signatures_is_empty(signature in arb_project()) {
        prop_assert!(diff(&signature, &signature).is_empty());
    }

    #[test]
    fn hinted_diff_simulates_to_target(old in arb_project(), new in arb_project()) {
        let hinted = hint(&old, &diff(&old, &new));
        prop_assert!(!hinted.has_unsupported());

        let simulated = simulate(&old, &hinted.mutation_specs()).unwrap();
        prop_assert_eq!(simulated, new);
    }

    #[test]
    fn deletions_precede_additions(old in arb_project(), new in arb_project()) {
        let mutations = diff(&old, &new);
        for app in ["blog", "shop"] {
            let of_app: Vec<&MutationSpec> = mutations.iter().filter(|m| m.app() == app).collect();
            let last_deletion = of_app.iter().rposition(|m| is_deletion(m));
            let first_addition = of_app.iter().position(|m| is_addition(m));
            if let (Some(deletion), Some(addition)) = (last_deletion, first_addition) {
                prop_assert!(deletion < addition, "{:?}", of_app);
            }
        }
    }

    #[test]
    fn signature_survives_json(signature in arb_project()) {
        let json = signature.to_json().unwrap();
        prop_assert_eq!(ProjectSignature::from_json(&json).unwrap(), signature);
    }
}
