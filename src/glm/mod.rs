//! Negative binomial GLM: design matrix, IRLS fitting, NB helpers

mod design;
mod fitting;
mod negative_binomial;

pub use design::{check_full_rank, create_design_matrix, DesignInfo};
pub use fitting::{fit_glm, fit_single_feature, GlmFit, GlmFitParams, GlmFitResult};
pub use negative_binomial::{nb_log_likelihood, nb_mean, nb_variance, nb_weight, MAX_LFC_BETA, MIN_MU};
