use crate::{
    config::TrainConfig,
    nn::{Linear, Model, Relu, ResidualMlp},
};

/// `input_proj -> act -> block -> head`, projecting tokens onto this rank's slice of the
/// vocabulary.
pub fn token_mlp(config: &TrainConfig) -> Model {
    let hidden = config.hidden_size;
    let seed = config.seed;
    Model::new()
        .push("input_proj", Linear::new("input_proj", hidden, hidden, seed))
        .push("act", Relu)
        .push(
            "block",
            ResidualMlp::new("block", hidden, 4 * hidden, seed.wrapping_add(10)),
        )
        .push(
            "head",
            Linear::new("head", hidden, config.label_classes(), seed.wrapping_add(20)),
        )
}
