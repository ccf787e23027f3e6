//! Authenticode signature verdict checks.

use crate::binary::signing::{classify_algorithm, AlgorithmStrength};
use crate::engine::results::RuleResult;
use crate::rules::{reasons, shared, AnalysisContext, Applicability, Rule};

/// BA2022: signed images must verify cleanly and use a strong digest.
pub struct SignSecurely;

impl Rule for SignSecurely {
    fn id(&self) -> &'static str {
        "BA2022"
    }

    fn name(&self) -> &'static str {
        "SignSecurely"
    }

    fn description(&self) -> &'static str {
        "Images should be correctly signed by trusted publishers using cryptographically \
         secure signature algorithms. This rule inspects the verification verdict \
         recorded for a signed binary. The verification excludes the certificate chain \
         root, and the rule then ensures that the binary was not signed with an insecure \
         digest such as SHA1 (currently deprecated by several companies including \
         Microsoft and Google due to its susceptibility to collision attacks)."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        if let Err(gate) = shared::pe_binary(ctx) {
            return gate;
        }
        // A verifier failure still reaches analysis so it can be reported.
        if ctx.target.signature_error.is_some() {
            return Applicability::Applicable;
        }
        match &ctx.target.signature {
            Some(verdict) if verdict.signed => Applicability::Applicable,
            _ => shared::skip(reasons::NOT_SIGNED),
        }
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        if let Some(error) = &ctx.target.signature_error {
            return vec![RuleResult::error(format!(
                "The signature of '{}' was invalid or there was an error opening the \
                 file: '{}'.",
                ctx.target.file_name, error,
            ))];
        }

        let Some(verdict) = &ctx.target.signature else {
            return Vec::new();
        };

        if !verdict.valid {
            let detail = verdict
                .validation_error
                .as_deref()
                .unwrap_or("signature chain verification did not succeed");
            return vec![RuleResult::error(format!(
                "'{}' signing verification failed with error: '{}'.",
                ctx.target.file_name, detail,
            ))];
        }

        if verdict.algorithms.is_empty() {
            return vec![RuleResult::error(format!(
                "'{}' signing verification failed with error: 'no signature digest \
                 algorithms were recorded'.",
                ctx.target.file_name,
            ))];
        }

        for algorithm in &verdict.algorithms {
            match classify_algorithm(algorithm) {
                AlgorithmStrength::Weak => {
                    return vec![RuleResult::error(format!(
                        "'{0}' is signed with a weak cryptographic algorithm '{1}'. \
                         '{1}' is or is shortly expected to be vulnerable to collision \
                         attacks. Sign this binary with a stronger cryptographic \
                         algorithm such as SHA256.",
                        ctx.target.file_name, algorithm,
                    ))];
                }
                AlgorithmStrength::Unrecognized => {
                    return vec![RuleResult::error(format!(
                        "'{}' is signed with '{}', an algorithm this check does not \
                         recognize and therefore cannot classify as strong or weak. \
                         Extend the signing policy data to cover this algorithm.",
                        ctx.target.file_name, algorithm,
                    ))];
                }
                AlgorithmStrength::Strong => {}
            }
        }

        vec![RuleResult::pass(format!(
            "'{}' appears to be signed securely by a trusted publisher with no \
             verification or time stamp errors. Revocation checking was performed on \
             the entire certificate chain, excluding the root certificate. The image \
             was signed with '{}', a cryptographically strong algorithm.",
            ctx.target.file_name,
            verdict.algorithms.join(", "),
        ))]
    }
}
